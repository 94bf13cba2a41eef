use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::db::models::{
    BusinessProfileRow, CreditBalanceRow, CreditTransactionRow, DatasetImageRow, DatasetRow,
    EnvironmentRow, GeneratedImageRow, PlanRow, TrainingStatus, UsageLogRow, UserProfileRow,
};

/// Case/whitespace-normalized form used for name-uniqueness checks.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Fields persisted for one successful generation. Rows are insert-only.
#[derive(Debug, Clone)]
pub struct GeneratedImageInsert {
    pub user_id: Option<String>,
    pub prompt: String,
    pub full_prompt: String,
    pub image_url: String,
    pub dataset_id: Option<String>,
    pub environment_id: Option<String>,
    pub style: Option<String>,
    pub image_style: String,
    pub aspect_ratio: String,
    pub quality: String,
    pub format: String,
    pub resolution: String,
    pub reference_images_count: i64,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS environments (\
                id TEXT PRIMARY KEY,\
                user_id TEXT NOT NULL,\
                name TEXT NOT NULL,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS datasets (\
                id TEXT PRIMARY KEY,\
                user_id TEXT,\
                environment_id TEXT,\
                name TEXT NOT NULL,\
                master_prompt TEXT,\
                training_status TEXT NOT NULL DEFAULT 'not_trained',\
                created_at TEXT NOT NULL,\
                FOREIGN KEY(environment_id) REFERENCES environments(id) ON DELETE CASCADE\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dataset_images (\
                id TEXT PRIMARY KEY,\
                dataset_id TEXT NOT NULL,\
                image_url TEXT NOT NULL,\
                analysis_result TEXT,\
                created_at TEXT NOT NULL,\
                FOREIGN KEY(dataset_id) REFERENCES datasets(id) ON DELETE CASCADE\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generated_images (\
                id TEXT PRIMARY KEY,\
                user_id TEXT,\
                prompt TEXT NOT NULL,\
                full_prompt TEXT NOT NULL,\
                image_url TEXT NOT NULL,\
                dataset_id TEXT,\
                environment_id TEXT,\
                style TEXT,\
                image_style TEXT NOT NULL,\
                aspect_ratio TEXT NOT NULL,\
                quality TEXT NOT NULL,\
                format TEXT NOT NULL,\
                resolution TEXT NOT NULL,\
                reference_images_count INTEGER NOT NULL,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS business_profiles (\
                id TEXT PRIMARY KEY,\
                business_name TEXT,\
                vibes TEXT,\
                theme TEXT\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_profiles (\
                id TEXT PRIMARY KEY,\
                first_name TEXT,\
                last_name TEXT,\
                creative_type TEXT\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plans (\
                id TEXT PRIMARY KEY,\
                name TEXT NOT NULL,\
                price_monthly INTEGER NOT NULL,\
                monthly_credits INTEGER NOT NULL\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credit_balances (\
                user_id TEXT PRIMARY KEY,\
                total_credits INTEGER NOT NULL DEFAULT 0,\
                used_credits INTEGER NOT NULL DEFAULT 0,\
                remaining_credits INTEGER NOT NULL DEFAULT 0\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credit_transactions (\
                id TEXT PRIMARY KEY,\
                user_id TEXT NOT NULL,\
                amount INTEGER NOT NULL,\
                kind TEXT NOT NULL,\
                description TEXT,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_logs (\
                id TEXT PRIMARY KEY,\
                user_id TEXT NOT NULL,\
                action TEXT NOT NULL,\
                credits_spent INTEGER NOT NULL,\
                metadata TEXT,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_datasets_environment_id ON datasets(environment_id);",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dataset_images_dataset_id ON dataset_images(dataset_id);",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credit_transactions_user_id ON credit_transactions(user_id);",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_logs_user_id ON usage_logs(user_id);")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- environments --

    pub async fn list_environments(&self, user_id: &str) -> Result<Vec<EnvironmentRow>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, user_id, name, created_at FROM environments \
             WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn environment_name_taken(&self, user_id: &str, name: &str) -> Result<bool> {
        // Normalization collapses inner whitespace, which SQL's trim() cannot,
        // so the comparison runs over the fetched names.
        let normalized = normalize_name(name);
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM environments WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(names
            .iter()
            .any(|(existing,)| normalize_name(existing) == normalized))
    }

    pub async fn create_environment(&self, user_id: &str, name: &str) -> Result<EnvironmentRow> {
        let row = EnvironmentRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.trim().to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO environments (id, user_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&row.id)
            .bind(&row.user_id)
            .bind(&row.name)
            .bind(row.created_at)
            .execute(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_environment(
        &self,
        environment_id: &str,
        user_id: &str,
    ) -> Result<Option<EnvironmentRow>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, user_id, name, created_at FROM environments WHERE id = ? AND user_id = ?",
        )
        .bind(environment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn rename_environment(
        &self,
        environment_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<Option<EnvironmentRow>> {
        let result = sqlx::query("UPDATE environments SET name = ? WHERE id = ? AND user_id = ?")
            .bind(name.trim())
            .bind(environment_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_environment(environment_id, user_id).await
    }

    /// Cascade-deletes all datasets in the environment and their image rows.
    pub async fn delete_environment(&self, environment_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM environments WHERE id = ? AND user_id = ?")
            .bind(environment_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_image_urls_for_environment(
        &self,
        environment_id: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT di.image_url FROM dataset_images di \
             JOIN datasets d ON d.id = di.dataset_id \
             WHERE d.environment_id = ?",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    // -- datasets (folders) --

    pub async fn list_folders(
        &self,
        environment_id: &str,
        user_id: &str,
    ) -> Result<Vec<DatasetRow>> {
        let rows = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, user_id, environment_id, name, master_prompt, training_status, created_at \
             FROM datasets WHERE environment_id = ? AND user_id = ? ORDER BY created_at",
        )
        .bind(environment_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_datasets_for_user(&self, user_id: &str) -> Result<Vec<DatasetRow>> {
        let rows = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, user_id, environment_id, name, master_prompt, training_status, created_at \
             FROM datasets WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn folder_name_taken(
        &self,
        user_id: &str,
        environment_id: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let normalized = normalize_name(name);
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM datasets WHERE user_id = ? AND environment_id IS ?",
        )
        .bind(user_id)
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names
            .iter()
            .any(|(existing,)| normalize_name(existing) == normalized))
    }

    pub async fn create_folder(
        &self,
        user_id: Option<&str>,
        environment_id: Option<&str>,
        name: &str,
    ) -> Result<DatasetRow> {
        let row = DatasetRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.map(str::to_string),
            environment_id: environment_id.map(str::to_string),
            name: name.trim().to_string(),
            master_prompt: None,
            training_status: TrainingStatus::NotTrained.as_str().to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO datasets (id, user_id, environment_id, name, master_prompt, training_status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.environment_id)
        .bind(&row.name)
        .bind(&row.master_prompt)
        .bind(&row.training_status)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetRow>> {
        let row = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, user_id, environment_id, name, master_prompt, training_status, created_at \
             FROM datasets WHERE id = ?",
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Creates the dataset on first upload if it does not exist yet.
    /// Anonymous uploads produce a dataset with no owner.
    pub async fn ensure_dataset(
        &self,
        dataset_id: &str,
        user_id: Option<&str>,
    ) -> Result<DatasetRow> {
        if let Some(existing) = self.get_dataset(dataset_id).await? {
            return Ok(existing);
        }
        let row = DatasetRow {
            id: dataset_id.to_string(),
            user_id: user_id.map(str::to_string),
            environment_id: None,
            name: "Untitled Dataset".to_string(),
            master_prompt: None,
            training_status: TrainingStatus::NotTrained.as_str().to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO datasets (id, user_id, environment_id, name, master_prompt, training_status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.environment_id)
        .bind(&row.name)
        .bind(&row.master_prompt)
        .bind(&row.training_status)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        info!("Created missing dataset {dataset_id}");
        Ok(row)
    }

    pub async fn rename_folder(
        &self,
        folder_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<Option<DatasetRow>> {
        let result = sqlx::query("UPDATE datasets SET name = ? WHERE id = ? AND user_id = ?")
            .bind(name.trim())
            .bind(folder_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_dataset(folder_id).await
    }

    pub async fn delete_folder(&self, folder_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = ? AND user_id = ?")
            .bind(folder_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_training_status(
        &self,
        dataset_id: &str,
        status: TrainingStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE datasets SET training_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- dataset images --

    pub async fn list_dataset_images(&self, dataset_id: &str) -> Result<Vec<DatasetImageRow>> {
        let rows = sqlx::query_as::<_, DatasetImageRow>(
            "SELECT id, dataset_id, image_url, analysis_result, created_at \
             FROM dataset_images WHERE dataset_id = ? ORDER BY created_at",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_image_urls_for_dataset(&self, dataset_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT image_url FROM dataset_images WHERE dataset_id = ?")
                .bind(dataset_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    pub async fn insert_dataset_image(
        &self,
        dataset_id: &str,
        image_url: &str,
        analysis_json: Option<&str>,
    ) -> Result<DatasetImageRow> {
        let row = DatasetImageRow {
            id: Uuid::new_v4().to_string(),
            dataset_id: dataset_id.to_string(),
            image_url: image_url.to_string(),
            analysis_result: analysis_json.map(str::to_string),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO dataset_images (id, dataset_id, image_url, analysis_result, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.dataset_id)
        .bind(&row.image_url)
        .bind(&row.analysis_result)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    // -- generated images --

    pub async fn insert_generated_image(
        &self,
        insert: GeneratedImageInsert,
    ) -> Result<GeneratedImageRow> {
        let row = GeneratedImageRow {
            id: Uuid::new_v4().to_string(),
            user_id: insert.user_id,
            prompt: insert.prompt,
            full_prompt: insert.full_prompt,
            image_url: insert.image_url,
            dataset_id: insert.dataset_id,
            environment_id: insert.environment_id,
            style: insert.style,
            image_style: insert.image_style,
            aspect_ratio: insert.aspect_ratio,
            quality: insert.quality,
            format: insert.format,
            resolution: insert.resolution,
            reference_images_count: insert.reference_images_count,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO generated_images \
             (id, user_id, prompt, full_prompt, image_url, dataset_id, environment_id, style, \
              image_style, aspect_ratio, quality, format, resolution, reference_images_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.prompt)
        .bind(&row.full_prompt)
        .bind(&row.image_url)
        .bind(&row.dataset_id)
        .bind(&row.environment_id)
        .bind(&row.style)
        .bind(&row.image_style)
        .bind(&row.aspect_ratio)
        .bind(&row.quality)
        .bind(&row.format)
        .bind(&row.resolution)
        .bind(row.reference_images_count)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    // -- profiles and plans --

    /// Not-found is not an error here: most users have no business profile.
    pub async fn get_business_profile(&self, user_id: &str) -> Result<Option<BusinessProfileRow>> {
        let row = sqlx::query_as::<_, BusinessProfileRow>(
            "SELECT id, business_name, vibes, theme FROM business_profiles WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_business_profile(
        &self,
        user_id: &str,
        business_name: Option<&str>,
        vibes: Option<&str>,
        theme: Option<&str>,
    ) -> Result<BusinessProfileRow> {
        sqlx::query(
            "INSERT INTO business_profiles (id, business_name, vibes, theme) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             business_name = COALESCE(excluded.business_name, business_name), \
             vibes = COALESCE(excluded.vibes, vibes), \
             theme = COALESCE(excluded.theme, theme)",
        )
        .bind(user_id)
        .bind(business_name)
        .bind(vibes)
        .bind(theme)
        .execute(&self.pool)
        .await?;
        let row = self.get_business_profile(user_id).await?;
        row.ok_or_else(|| anyhow::anyhow!("business profile missing after upsert"))
    }

    pub async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfileRow>> {
        let row = sqlx::query_as::<_, UserProfileRow>(
            "SELECT id, first_name, last_name, creative_type FROM user_profiles WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_user_profile(
        &self,
        user_id: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        creative_type: Option<&str>,
    ) -> Result<UserProfileRow> {
        sqlx::query(
            "INSERT INTO user_profiles (id, first_name, last_name, creative_type) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             first_name = COALESCE(excluded.first_name, first_name), \
             last_name = COALESCE(excluded.last_name, last_name), \
             creative_type = COALESCE(excluded.creative_type, creative_type)",
        )
        .bind(user_id)
        .bind(first_name)
        .bind(last_name)
        .bind(creative_type)
        .execute(&self.pool)
        .await?;
        let row = self.get_user_profile(user_id).await?;
        row.ok_or_else(|| anyhow::anyhow!("user profile missing after upsert"))
    }

    pub async fn list_plans(&self) -> Result<Vec<PlanRow>> {
        let rows = sqlx::query_as::<_, PlanRow>(
            "SELECT id, name, price_monthly, monthly_credits FROM plans ORDER BY price_monthly",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- credit ledger --

    pub async fn get_credit_balance(&self, user_id: &str) -> Result<Option<CreditBalanceRow>> {
        let row = sqlx::query_as::<_, CreditBalanceRow>(
            "SELECT user_id, total_credits, used_credits, remaining_credits \
             FROM credit_balances WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn grant_credits(&self, user_id: &str, amount: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_balances (user_id, total_credits, used_credits, remaining_credits) \
             VALUES (?, ?, 0, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             total_credits = total_credits + excluded.total_credits, \
             remaining_credits = remaining_credits + excluded.remaining_credits",
        )
        .bind(user_id)
        .bind(amount)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic conditional decrement. Returns false when the balance row is
    /// missing or holds fewer credits than `cost`; nothing is mutated then.
    pub async fn try_debit_credits(&self, user_id: &str, cost: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credit_balances \
             SET remaining_credits = remaining_credits - ?, used_credits = used_credits + ? \
             WHERE user_id = ? AND remaining_credits >= ?",
        )
        .bind(cost)
        .bind(cost)
        .bind(user_id)
        .bind(cost)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_credit_transaction(
        &self,
        user_id: &str,
        amount: i64,
        kind: &str,
        description: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_transactions (id, user_id, amount, kind, description, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(amount)
        .bind(kind)
        .bind(description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_usage_log(
        &self,
        user_id: &str,
        action: &str,
        credits_spent: i64,
        metadata: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_logs (id, user_id, action, credits_spent, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(action)
        .bind(credits_spent)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_credit_transactions(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransactionRow>> {
        let rows = sqlx::query_as::<_, CreditTransactionRow>(
            "SELECT id, user_id, amount, kind, description, created_at \
             FROM credit_transactions WHERE user_id = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_usage_logs(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UsageLogRow>> {
        let rows = sqlx::query_as::<_, UsageLogRow>(
            "SELECT id, user_id, action, credits_spent, metadata, created_at \
             FROM usage_logs WHERE user_id = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_credit_transactions(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM credit_transactions WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::init("sqlite::memory:")
            .await
            .expect("in-memory database")
    }

    #[test]
    fn normalizes_names_for_uniqueness() {
        assert_eq!(normalize_name("  Product   Shots "), "product shots");
        assert_eq!(normalize_name("PRODUCT SHOTS"), "product shots");
    }

    #[tokio::test]
    async fn business_profile_upsert_merges_partial_updates() {
        let db = test_db().await;
        let row = db
            .upsert_business_profile("user-1", Some("Acme Shoes"), None, None)
            .await
            .unwrap();
        assert_eq!(row.business_name.as_deref(), Some("Acme Shoes"));
        assert!(row.vibes.is_none());

        let row = db
            .upsert_business_profile("user-1", None, Some("playful"), None)
            .await
            .unwrap();
        assert_eq!(row.business_name.as_deref(), Some("Acme Shoes"));
        assert_eq!(row.vibes.as_deref(), Some("playful"));

        assert!(db.get_business_profile("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn name_taken_ignores_case_and_inner_whitespace() {
        let db = test_db().await;
        db.create_environment("user-1", "Product  Shots").await.unwrap();
        assert!(db
            .environment_name_taken("user-1", "Product Shots")
            .await
            .unwrap());
        assert!(db
            .environment_name_taken("user-1", "  product   shots ")
            .await
            .unwrap());
        assert!(!db
            .environment_name_taken("user-2", "Product Shots")
            .await
            .unwrap());

        db.create_folder(Some("user-1"), None, "Summer  Looks")
            .await
            .unwrap();
        assert!(db
            .folder_name_taken("user-1", None, "summer looks")
            .await
            .unwrap());
        assert!(!db
            .folder_name_taken("user-1", Some("env-1"), "summer looks")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn environment_delete_cascades_to_folders_and_images() {
        let db = test_db().await;
        let env = db.create_environment("user-1", "Brand").await.unwrap();
        let folder = db
            .create_folder(Some("user-1"), Some(&env.id), "Product")
            .await
            .unwrap();
        db.insert_dataset_image(&folder.id, "https://cdn/x.png", None)
            .await
            .unwrap();

        assert!(db.delete_environment(&env.id, "user-1").await.unwrap());
        assert!(db.get_dataset(&folder.id).await.unwrap().is_none());
        assert!(db
            .list_dataset_images(&folder.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn folder_delete_removes_image_rows() {
        let db = test_db().await;
        let folder = db.create_folder(Some("user-1"), None, "Loose").await.unwrap();
        db.insert_dataset_image(&folder.id, "https://cdn/a.png", None)
            .await
            .unwrap();
        db.insert_dataset_image(&folder.id, "https://cdn/b.png", None)
            .await
            .unwrap();

        assert!(db.delete_folder(&folder.id, "user-1").await.unwrap());
        assert!(db
            .list_dataset_images(&folder.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_foreign_owner() {
        let db = test_db().await;
        let folder = db.create_folder(Some("user-1"), None, "Mine").await.unwrap();
        assert!(!db.delete_folder(&folder.id, "user-2").await.unwrap());
        assert!(db.get_dataset(&folder.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conditional_debit_is_all_or_nothing() {
        let db = test_db().await;
        db.grant_credits("user-1", 3).await.unwrap();

        assert!(!db.try_debit_credits("user-1", 5).await.unwrap());
        let balance = db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 3);
        assert_eq!(balance.used_credits, 0);

        assert!(db.try_debit_credits("user-1", 2).await.unwrap());
        let balance = db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 1);
        assert_eq!(balance.used_credits, 2);
    }

    #[tokio::test]
    async fn ensure_dataset_is_idempotent() {
        let db = test_db().await;
        let first = db.ensure_dataset("fixed-id", None).await.unwrap();
        let second = db.ensure_dataset("fixed-id", Some("user-1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.user_id, None);
        assert_eq!(first.name, "Untitled Dataset");
    }
}
