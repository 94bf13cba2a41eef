use tracing::{info, warn};

use crate::db::database::Database;
use crate::error::ApiError;

/// Credit metering around expensive actions. The balance decrement is a
/// single conditional UPDATE, so two concurrent debits can never spend the
/// same credit twice.
#[derive(Clone)]
pub struct CreditLedger {
    db: Database,
}

impl CreditLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Checks whether the user could afford `cost` right now, without
    /// spending anything. Callers use this to fail fast before starting an
    /// expensive action; [`debit`](Self::debit) remains the authority.
    pub async fn can_afford(&self, user_id: &str, cost: i64) -> Result<bool, ApiError> {
        let balance = self.db.get_credit_balance(user_id).await?;
        Ok(balance.map(|row| row.remaining_credits >= cost).unwrap_or(false))
    }

    /// Debits `cost` credits and records a transaction plus a usage row.
    /// Fails with [`ApiError::InsufficientCredit`] and no mutation when the
    /// balance cannot cover the cost.
    pub async fn debit(
        &self,
        user_id: &str,
        cost: i64,
        action: &str,
        metadata: Option<&str>,
    ) -> Result<(), ApiError> {
        if cost <= 0 {
            return Ok(());
        }

        if !self.db.try_debit_credits(user_id, cost).await? {
            let remaining = self
                .db
                .get_credit_balance(user_id)
                .await?
                .map(|row| row.remaining_credits)
                .unwrap_or(0);
            return Err(ApiError::InsufficientCredit {
                required: cost,
                remaining,
            });
        }

        self.db
            .insert_credit_transaction(user_id, -cost, "usage", Some(action))
            .await?;
        self.db
            .insert_usage_log(user_id, action, cost, metadata)
            .await?;
        info!("Debited {cost} credits from {user_id} for {action}");
        Ok(())
    }

    /// Best-effort debit for actions whose result must not be discarded
    /// over bookkeeping. A failed or insufficient debit only logs.
    pub async fn debit_or_log(&self, user_id: &str, cost: i64, action: &str, metadata: Option<&str>) {
        if let Err(err) = self.debit(user_id, cost, action, metadata).await {
            warn!("Metering {action} for {user_id} failed after the fact: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger_with_credits(amount: i64) -> (CreditLedger, Database) {
        let db = Database::init("sqlite::memory:").await.unwrap();
        db.grant_credits("user-1", amount).await.unwrap();
        (CreditLedger::new(db.clone()), db)
    }

    #[tokio::test]
    async fn insufficient_balance_short_circuits_without_mutation() {
        let (ledger, db) = ledger_with_credits(3).await;

        let err = ledger.debit("user-1", 5, "generation", None).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::InsufficientCredit {
                required: 5,
                remaining: 3
            }
        ));

        let balance = db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 3);
        assert_eq!(balance.used_credits, 0);
        assert_eq!(db.count_credit_transactions("user-1").await.unwrap(), 0);
        assert!(db.list_usage_logs("user-1", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_debit_writes_transaction_and_usage_rows() {
        let (ledger, db) = ledger_with_credits(10).await;

        ledger
            .debit("user-1", 5, "generation", Some(r#"{"dataset":"ds-1"}"#))
            .await
            .unwrap();

        let balance = db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 5);
        assert_eq!(balance.used_credits, 5);

        let transactions = db.list_credit_transactions("user-1", 10, 0).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, -5);
        assert_eq!(transactions[0].kind, "usage");

        let usage = db.list_usage_logs("user-1", 10, 0).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].action, "generation");
        assert_eq!(usage[0].credits_spent, 5);
    }

    #[tokio::test]
    async fn unknown_user_cannot_afford_anything() {
        let db = Database::init("sqlite::memory:").await.unwrap();
        let ledger = CreditLedger::new(db);
        assert!(!ledger.can_afford("ghost", 1).await.unwrap());
        assert!(matches!(
            ledger.debit("ghost", 1, "generation", None).await,
            Err(ApiError::InsufficientCredit { .. })
        ));
    }

    #[tokio::test]
    async fn zero_cost_actions_are_free() {
        let (ledger, db) = ledger_with_credits(2).await;
        ledger.debit("user-1", 0, "analysis", None).await.unwrap();
        let balance = db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 2);
    }
}
