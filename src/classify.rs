//! Deterministic query classification
//!
//! Ordered pattern list, first match wins. No external calls; runs in
//! O(|patterns| * |query|) before anything else in the pipeline.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::kb::EntryType;

/// Fast query tag produced before any LLM call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Greeting,
    Error,
    Definition,
    Howto,
    Workflow,
    General,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::Greeting => "greeting",
            QueryType::Error => "error",
            QueryType::Definition => "definition",
            QueryType::Howto => "howto",
            QueryType::Workflow => "workflow",
            QueryType::General => "general",
        };
        f.write_str(s)
    }
}

impl QueryType {
    /// Map a query type onto the KB's entry-type vocabulary.
    /// `howto` normalises to `how_to`; greetings and general queries have
    /// no entry-type counterpart.
    pub fn entry_type(&self) -> Option<EntryType> {
        match self {
            QueryType::Howto => Some(EntryType::HowTo),
            QueryType::Error => Some(EntryType::Error),
            QueryType::Definition => Some(EntryType::Definition),
            QueryType::Workflow => Some(EntryType::Workflow),
            QueryType::Greeting | QueryType::General => None,
        }
    }
}

/// Classification output
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub confidence: f64,
}

lazy_static! {
    static ref PATTERNS: Vec<(Regex, QueryType, f64)> = vec![
        (
            Regex::new(r"(?i)^\s*(hi|hello|hey|howdy|good\s+(morning|afternoon|evening)|greetings)\b[\s!.,]*$").unwrap(),
            QueryType::Greeting,
            0.95,
        ),
        (
            Regex::new(r"(?i)\b(error|errors|failed|failing|fails|broken|crash(es|ed)?|exception|not\s+working|won'?t\s+(load|open|save|work)|can'?t\s+(log\s*in|login|access))\b").unwrap(),
            QueryType::Error,
            0.85,
        ),
        (
            Regex::new(r"(?i)\b(how\s+(do|can|to|does)\b|steps?\s+(to|for)\b|guide\s+(to|for)\b|instructions?\s+for\b)").unwrap(),
            QueryType::Howto,
            0.80,
        ),
        (
            Regex::new(r"(?i)(^\s*what\s+(is|are|does)\b|\bmeaning\s+of\b|\bdefin(e|ition)\b|\bexplain\s+what\b)").unwrap(),
            QueryType::Definition,
            0.75,
        ),
        (
            Regex::new(r"(?i)\b(workflow|process\s+for|procedure|approval|sign[\s-]?off|pipeline\s+for)\b").unwrap(),
            QueryType::Workflow,
            0.75,
        ),
    ];
}

/// Classify a raw query. Falls back to `general` with confidence 0.3.
pub fn classify(query: &str) -> Classification {
    for (pattern, query_type, confidence) in PATTERNS.iter() {
        if pattern.is_match(query) {
            return Classification {
                query_type: *query_type,
                confidence: *confidence,
            };
        }
    }
    Classification {
        query_type: QueryType::General,
        confidence: 0.3,
    }
}

/// Whether the query text explicitly asks for a human.
/// Checked right after classification; a hit short-circuits the rest of
/// the pipeline.
pub fn wants_human(query: &str, phrases: &[String]) -> bool {
    let lowered = query.to_lowercase();
    phrases.iter().any(|phrase| lowered.contains(phrase.as_str()))
}

/// Canned reply for greeting queries; produced without any LLM call
pub fn greeting_reply() -> &'static str {
    "Hello! I'm here to help with questions about our platform. What would you like to know?"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_detection() {
        assert_eq!(classify("hi").query_type, QueryType::Greeting);
        assert_eq!(classify("Hello!").query_type, QueryType::Greeting);
        assert_eq!(classify("good morning").query_type, QueryType::Greeting);
        // A greeting embedded in a real question is not a greeting
        assert_ne!(classify("hi, how do I upload photos").query_type, QueryType::Greeting);
    }

    #[test]
    fn test_error_beats_howto() {
        // First match wins: error pattern is ordered before howto
        let c = classify("how do I fix this upload error");
        assert_eq!(c.query_type, QueryType::Error);
    }

    #[test]
    fn test_howto() {
        let c = classify("how do I upload photos");
        assert_eq!(c.query_type, QueryType::Howto);
        assert!(c.confidence >= 0.8);
        assert_eq!(c.query_type.entry_type(), Some(EntryType::HowTo));
    }

    #[test]
    fn test_definition() {
        assert_eq!(classify("what is a listing feed").query_type, QueryType::Definition);
        assert_eq!(classify("meaning of syndication").query_type, QueryType::Definition);
    }

    #[test]
    fn test_workflow() {
        assert_eq!(classify("approval process for mandates").query_type, QueryType::Workflow);
    }

    #[test]
    fn test_general_fallback() {
        let c = classify("bananas in the office fridge");
        assert_eq!(c.query_type, QueryType::General);
        assert!((c.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_wants_human() {
        let phrases = crate::config::EngineConfig::default().escalation_phrases;
        assert!(wants_human("please raise a ticket for me", &phrases));
        assert!(wants_human("I want to TALK TO SUPPORT now", &phrases));
        assert!(!wants_human("how do I upload photos", &phrases));
    }
}
