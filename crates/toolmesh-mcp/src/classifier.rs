//! Free-text request classification against fixed domain keyword tables.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Score contribution of one matching token to confidence.
const CONFIDENCE_PER_HIT: f64 = 0.25;

/// Tokens shorter than this are ignored.
const MIN_TOKEN_LEN: usize = 3;

/// Tool domain. Declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Query,
    Analysis,
    Database,
    /// Neutral default when nothing matched.
    General,
}

impl Domain {
    /// Domains that carry keyword tables, in tie-break order.
    pub const SCORED: [Domain; 3] = [Domain::Query, Domain::Analysis, Domain::Database];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Query => "query",
            Domain::Analysis => "analysis",
            Domain::Database => "database",
            Domain::General => "general",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Domain::Query => &[
                "query", "list", "show", "find", "search", "get", "select", "lookup", "table",
                "schema", "describe", "fetch", "read", "column",
            ],
            Domain::Analysis => &[
                "analyze",
                "analysis",
                "trend",
                "insight",
                "summarize",
                "summary",
                "compare",
                "report",
                "forecast",
                "explain",
                "pattern",
                "statistics",
                "visualize",
            ],
            Domain::Database => &[
                "database",
                "sql",
                "insert",
                "update",
                "delete",
                "create",
                "drop",
                "alter",
                "migrate",
                "execute",
                "index",
                "transaction",
                "write",
                "run",
            ],
            Domain::General => &[],
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub primary: Domain,
    /// Other domains with a non-zero score, best first.
    pub secondary: Vec<Domain>,
    /// `min(top score × 0.25, 1.0)`.
    pub confidence: f64,
    pub scores: BTreeMap<Domain, usize>,
}

/// Scores text against the domain keyword tables. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestClassifier;

impl RequestClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> Classification {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
            .collect();

        let scores: BTreeMap<Domain, usize> = Domain::SCORED
            .iter()
            .map(|domain| {
                let keywords = domain.keywords();
                let hits = tokens
                    .iter()
                    .filter(|token| {
                        keywords
                            .iter()
                            .any(|kw| kw.contains(**token) || token.contains(kw))
                    })
                    .count();
                (*domain, hits)
            })
            .collect();

        // Stable sort keeps tie-break order for equal scores.
        let mut ranked: Vec<(Domain, usize)> = Domain::SCORED
            .iter()
            .map(|d| (*d, scores.get(d).copied().unwrap_or(0)))
            .filter(|(_, score)| *score > 0)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let Some(&(primary, top)) = ranked.first() else {
            return Classification {
                primary: Domain::General,
                secondary: Vec::new(),
                confidence: 0.0,
                scores,
            };
        };

        Classification {
            primary,
            secondary: ranked.iter().skip(1).map(|(d, _)| *d).collect(),
            confidence: (top as f64 * CONFIDENCE_PER_HIT).min(1.0),
            scores,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_general() {
        let c = RequestClassifier::new().classify("");
        assert_eq!(c.primary, Domain::General);
        assert!(c.secondary.is_empty());
        assert_eq!(c.confidence, 0.0);
        assert!(c.scores.values().all(|s| *s == 0));
    }

    #[test]
    fn test_deterministic() {
        let classifier = RequestClassifier::new();
        let text = "Show me the tables and analyze last month's sales trend";
        assert_eq!(classifier.classify(text), classifier.classify(text));
    }

    #[test]
    fn test_primary_and_secondary() {
        let c = RequestClassifier::new()
            .classify("list all tables, show the schema, then analyze the trend");
        assert_eq!(c.primary, Domain::Query);
        assert_eq!(c.secondary, vec![Domain::Analysis]);
        assert_eq!(c.scores[&Domain::Query], 4);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_ties_follow_domain_order() {
        // One hit each for analysis ("report") and database ("sql").
        let c = RequestClassifier::new().classify("sql report");
        assert_eq!(c.primary, Domain::Analysis);
        assert_eq!(c.secondary, vec![Domain::Database]);
        assert_eq!(c.confidence, 0.25);
    }

    #[test]
    fn test_short_tokens_ignored() {
        let c = RequestClassifier::new().classify("do it on db");
        assert_eq!(c.primary, Domain::General);
    }

    #[test]
    fn test_token_contained_in_keyword_counts() {
        // "stat" is a substring of "statistics".
        let c = RequestClassifier::new().classify("stat");
        assert_eq!(c.primary, Domain::Analysis);
    }

    #[test]
    fn test_serializes_domain_names() {
        let c = RequestClassifier::new().classify("insert a row");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["primary"], "database");
        assert_eq!(json["scores"]["database"], 1);
    }
}
