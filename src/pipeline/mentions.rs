use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Pluggable string-similarity strategy for fuzzy name matching. The
/// default is a character-bigram Dice coefficient; swapping in a trigram
/// or edit-distance scorer does not touch the resolver's control flow.
pub trait StringSimilarity: Send + Sync {
    /// Returns a score in [0, 1]; 1 means identical.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

#[derive(Debug, Default)]
pub struct BigramDice;

fn bigrams(text: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut counts = HashMap::new();
    for window in chars.windows(2) {
        *counts.entry((window[0], window[1])).or_insert(0) += 1;
    }
    counts
}

impl StringSimilarity for BigramDice {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let a_grams = bigrams(a);
        let b_grams = bigrams(b);
        let a_total: usize = a_grams.values().sum();
        let b_total: usize = b_grams.values().sum();
        if a_total == 0 || b_total == 0 {
            return 0.0;
        }
        let overlap: usize = a_grams
            .iter()
            .map(|(gram, count)| count.min(b_grams.get(gram).unwrap_or(&0)))
            .sum();
        2.0 * overlap as f64 / (a_total + b_total) as f64
    }
}

/// A folder candidate the resolver can point a mention at.
#[derive(Debug, Clone)]
pub struct FolderRef {
    pub id: String,
    pub name: String,
    pub environment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnvironmentRef {
    pub id: String,
    pub name: String,
}

const DEFAULT_FUZZY_CUTOFF: f64 = 0.72;
const MAX_MENTION_TOKENS: usize = 6;

/// Low-signal words that end a mention; "@Product Shots standing in snow"
/// mentions the folder "Product Shots".
const STOP_WORDS: &[&str] = &[
    "standing", "holding", "sitting", "wearing", "in", "on", "at", "of", "with", "and", "the", "a",
    "an", "for", "from", "to",
];

static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([\w-]+(?:/[\w-]+)?(?:[ \t]+[\w-]+)*)").expect("mention regex")
});

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One `@...` token pulled out of a prompt, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// Environment fragment of a path mention (`@env/folder`), if present.
    pub environment: Option<String>,
    /// Candidate folder-name token sequences, longest first. Multi-word
    /// captures are ambiguous, so resolution tries each prefix in turn.
    pub name_candidates: Vec<String>,
}

pub fn extract_mentions(prompt: &str) -> Vec<Mention> {
    let mut mentions = Vec::new();
    for capture in MENTION_RE.captures_iter(prompt) {
        let raw = &capture[1];
        let (environment, rest) = match raw.split_once('/') {
            Some((env, rest)) => (Some(env.to_string()), rest),
            None => (None, raw),
        };

        let mut tokens: Vec<&str> = Vec::new();
        for token in rest.split_whitespace() {
            if tokens.len() == MAX_MENTION_TOKENS {
                break;
            }
            if !tokens.is_empty() && STOP_WORDS.contains(&token.to_lowercase().as_str()) {
                break;
            }
            tokens.push(token);
        }
        if tokens.is_empty() {
            continue;
        }

        let name_candidates: Vec<String> = (1..=tokens.len())
            .rev()
            .map(|len| tokens[..len].join(" "))
            .collect();
        mentions.push(Mention {
            environment,
            name_candidates,
        });
    }
    mentions
}

pub struct MentionResolver {
    similarity: Box<dyn StringSimilarity>,
    fuzzy_cutoff: f64,
}

impl Default for MentionResolver {
    fn default() -> Self {
        Self {
            similarity: Box::new(BigramDice),
            fuzzy_cutoff: DEFAULT_FUZZY_CUTOFF,
        }
    }
}

impl MentionResolver {
    pub fn new(similarity: Box<dyn StringSimilarity>, fuzzy_cutoff: f64) -> Self {
        Self {
            similarity,
            fuzzy_cutoff,
        }
    }

    /// Resolves `@folder` / `@environment/folder` mentions in a prompt
    /// against the user's folders. Explicit identifiers always come first;
    /// unresolvable mentions are dropped silently. Resolution is a pure
    /// lookup over the supplied sets, so identical inputs always produce
    /// the identical ordered result.
    pub fn resolve(
        &self,
        prompt: &str,
        explicit_ids: &[String],
        environments: &[EnvironmentRef],
        folders: &[FolderRef],
    ) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::new();
        for id in explicit_ids {
            if !resolved.contains(id) {
                resolved.push(id.clone());
            }
        }

        for mention in extract_mentions(prompt) {
            let scoped: Vec<&FolderRef> = match mention
                .environment
                .as_deref()
                .and_then(|fragment| self.match_environment(fragment, environments))
            {
                Some(environment_id) => folders
                    .iter()
                    .filter(|folder| folder.environment_id.as_deref() == Some(environment_id))
                    .collect(),
                None => folders.iter().collect(),
            };

            let matched = mention
                .name_candidates
                .iter()
                .find_map(|candidate| self.match_folder(candidate, &scoped));
            match matched {
                Some(folder_id) => {
                    if !resolved.contains(&folder_id) {
                        resolved.push(folder_id);
                    }
                }
                None => {
                    debug!(
                        "Unresolved mention {:?}; dropping",
                        mention.name_candidates.first()
                    );
                }
            }
        }

        resolved
    }

    fn match_environment<'a>(
        &self,
        fragment: &str,
        environments: &'a [EnvironmentRef],
    ) -> Option<&'a str> {
        let target = normalize_name(fragment);
        let mut best: Option<(f64, &EnvironmentRef)> = None;
        for environment in environments {
            let score = self.similarity.similarity(&target, &normalize_name(&environment.name));
            if score >= self.fuzzy_cutoff && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true)
            {
                best = Some((score, environment));
            }
        }
        best.map(|(_, environment)| environment.id.as_str())
    }

    /// Exact normalized match, then substring containment either direction,
    /// then fuzzy. The first method to succeed wins; within a method the
    /// earliest-declared folder wins ties.
    fn match_folder(&self, candidate: &str, folders: &[&FolderRef]) -> Option<String> {
        let target = normalize_name(candidate);
        if target.is_empty() {
            return None;
        }

        for folder in folders {
            if normalize_name(&folder.name) == target {
                return Some(folder.id.clone());
            }
        }

        for folder in folders {
            let name = normalize_name(&folder.name);
            if name.contains(&target) || target.contains(&name) {
                return Some(folder.id.clone());
            }
        }

        let mut best: Option<(f64, &&FolderRef)> = None;
        for folder in folders {
            let score = self
                .similarity
                .similarity(&target, &normalize_name(&folder.name));
            if score >= self.fuzzy_cutoff && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true)
            {
                best = Some((score, folder));
            }
        }
        best.map(|(_, folder)| folder.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, name: &str, environment_id: Option<&str>) -> FolderRef {
        FolderRef {
            id: id.to_string(),
            name: name.to_string(),
            environment_id: environment_id.map(str::to_string),
        }
    }

    fn environment(id: &str, name: &str) -> EnvironmentRef {
        EnvironmentRef {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn dice_similarity_is_bounded_and_symmetric() {
        let sim = BigramDice;
        let score = sim.similarity("product shots", "product shot");
        assert!(score > 0.72 && score < 1.0);
        assert!(sim.similarity("abc", "xyz") <= sim.similarity("abc", "abd"));
        assert_eq!(sim.similarity("same", "same"), 1.0);
        assert_eq!(sim.similarity("", "anything"), 0.0);
    }

    #[test]
    fn extracts_plain_and_path_mentions() {
        let mentions = extract_mentions("use @Brand/Product and @Shoes please");
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].environment.as_deref(), Some("Brand"));
        assert_eq!(mentions[0].name_candidates[0], "Product");
        assert_eq!(mentions[1].environment, None);
    }

    #[test]
    fn stop_words_cut_the_mention_short() {
        let mentions = extract_mentions("@Product Shots standing in the snow");
        assert_eq!(mentions[0].name_candidates[0], "Product Shots");
    }

    #[test]
    fn mention_token_count_is_capped() {
        let mentions = extract_mentions("@one two three four five six seven eight");
        assert_eq!(
            mentions[0].name_candidates[0],
            "one two three four five six"
        );
    }

    #[test]
    fn explicit_ids_precede_prompt_mentions() {
        let resolver = MentionResolver::default();
        let folders = vec![folder("f1", "Shoes", None), folder("f2", "Hats", None)];
        let resolved = resolver.resolve(
            "show @Hats",
            &["f1".to_string()],
            &[],
            &folders,
        );
        assert_eq!(resolved, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn path_mentions_scope_to_the_matched_environment() {
        let resolver = MentionResolver::default();
        let environments = vec![environment("e1", "Summer Brand"), environment("e2", "Winter")];
        let folders = vec![
            folder("f1", "Shoes", Some("e1")),
            folder("f2", "Shoes", Some("e2")),
        ];
        let resolved = resolver.resolve("make @Winter/Shoes", &[], &environments, &folders);
        assert_eq!(resolved, vec!["f2".to_string()]);
    }

    #[test]
    fn falls_back_to_substring_then_fuzzy() {
        let resolver = MentionResolver::default();
        let folders = vec![folder("f1", "Studio Product Shots", None)];
        // substring containment
        assert_eq!(
            resolver.resolve("use @product", &[], &[], &folders),
            vec!["f1".to_string()]
        );
        // fuzzy within cutoff
        let folders = vec![folder("f1", "sneakers", None)];
        assert_eq!(
            resolver.resolve("use @sneaker", &[], &[], &folders),
            vec!["f1".to_string()]
        );
    }

    #[test]
    fn unresolved_mentions_are_dropped_silently() {
        let resolver = MentionResolver::default();
        let folders = vec![folder("f1", "Shoes", None)];
        let resolved = resolver.resolve("use @zzzqqq today", &[], &[], &folders);
        assert!(resolved.is_empty());
    }

    #[test]
    fn resolution_is_idempotent_and_deduplicated() {
        let resolver = MentionResolver::default();
        let environments = vec![environment("e1", "Brand")];
        let folders = vec![
            folder("f1", "Shoes", Some("e1")),
            folder("f2", "Hats", Some("e1")),
        ];
        let prompt = "mix @Shoes with @Brand/Hats and again @Shoes";
        let first = resolver.resolve(prompt, &[], &environments, &folders);
        let second = resolver.resolve(prompt, &[], &environments, &folders);
        assert_eq!(first, vec!["f1".to_string(), "f2".to_string()]);
        assert_eq!(first, second);
    }
}
