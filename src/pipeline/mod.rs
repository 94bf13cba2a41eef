pub mod analyze;
pub mod assembler;
pub mod generate;
pub mod mentions;
pub mod ranker;
pub mod rerank;

/// Strips a single markdown code fence (```json ... ``` or ``` ... ```)
/// wrapping a model response, leaving the inner payload untouched.
pub(crate) fn strip_json_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
