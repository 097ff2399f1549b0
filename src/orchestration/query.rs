//! Source query parsing.
//!
//! A query is either a `;`-separated list of group ids, which forms a single
//! part, or a JSON array of parts such as
//! `[{"type":"SecurityGroup","source":"id;id"}]`.

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct QueryPart {
    source: String,
}

/// Splits a job query into its parts, in order. Always yields at least one
/// part; an empty array becomes a single part with no sources.
pub fn parse_query_parts(query: &str) -> Vec<String> {
    let trimmed = query.trim();
    if trimmed.starts_with('[')
        && let Ok(parts) = serde_json::from_str::<Vec<QueryPart>>(trimmed)
    {
        if parts.is_empty() {
            return vec![String::new()];
        }
        return parts.into_iter().map(|part| part.source).collect();
    }
    vec![trimmed.to_string()]
}

/// Group ids found in one part's source string.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedGroups {
    /// Distinct ids in first-seen order
    pub valid: Vec<Uuid>,
    pub invalid: Vec<String>,
}

pub fn parse_group_ids(source: &str) -> ParsedGroups {
    let mut parsed = ParsedGroups::default();
    for token in source.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        match Uuid::parse_str(token) {
            Ok(id) if !parsed.valid.contains(&id) => parsed.valid.push(id),
            Ok(_) => {}
            Err(_) => parsed.invalid.push(token.to_string()),
        }
    }
    parsed
}
