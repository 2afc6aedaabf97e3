//! Host tag vs layer tag expression matching.
//!
//! A layer's tag expression is a list of keywords separated by `|`, `,` or
//! whitespace. The match is disjunctive and case-insensitive: the score is
//! the number of expression keywords the host carries, and any score above
//! zero is a match.

/// Split a tag expression into lowercase keywords.
pub fn keywords(expression: &str) -> Vec<String> {
    expression
        .split(|c: char| c == '|' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Relevance of a host's tags to a layer's tag expression.
pub fn score(host_tags: &[String], expression: &str) -> u32 {
    let wanted = keywords(expression);
    let hits = host_tags
        .iter()
        .filter(|tag| wanted.iter().any(|w| tag.eq_ignore_ascii_case(w)))
        .count();
    u32::try_from(hits).unwrap_or(u32::MAX)
}

/// True if the host carries at least one keyword of the expression.
/// An empty expression matches nothing.
pub fn matches(host_tags: &[String], expression: &str) -> bool {
    score(host_tags, expression) > 0
}
