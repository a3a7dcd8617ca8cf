//! Knowledge-base domain types
//!
//! Chunks are authored and embedded by an external ingestion pipeline; the
//! engine only consumes them through the `VectorIndex` interface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// KB entry type, matched against the classifier's query type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    HowTo,
    Error,
    Definition,
    Workflow,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::HowTo => "how_to",
            EntryType::Error => "error",
            EntryType::Definition => "definition",
            EntryType::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

impl EntryType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "how_to" => Some(EntryType::HowTo),
            "error" => Some(EntryType::Error),
            "definition" => Some(EntryType::Definition),
            "workflow" => Some(EntryType::Workflow),
            _ => None,
        }
    }
}

/// Audience a chunk is authored for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Internal,
    External,
    Both,
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserType::Internal => "internal",
            UserType::External => "external",
            UserType::Both => "both",
        };
        f.write_str(s)
    }
}

impl UserType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(UserType::Internal),
            "external" => Some(UserType::External),
            "both" => Some(UserType::Both),
            _ => None,
        }
    }
}

/// One embeddable sub-part of a KB document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbChunk {
    pub chunk_id: String,
    pub parent_entry_id: String,
    pub parent_title: String,
    pub content: String,
    pub section_label: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub entry_type: EntryType,
    pub user_type: UserType,
    pub category: String,
    #[serde(default)]
    pub related_documents: BTreeSet<String>,
}

/// A chunk with its vector-search similarity score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: KbChunk,
    pub similarity: f64,
}

/// Metadata filter for one vector-search attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryType>,
    /// Caller's audience plus `both`; empty means no audience restriction
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_types: Vec<UserType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl MetadataFilter {
    pub fn for_audience(user_type: UserType) -> Self {
        Self {
            entry_type: None,
            user_types: vec![user_type, UserType::Both],
            category: None,
        }
    }

    /// Whether a chunk passes this filter
    pub fn matches(&self, chunk: &KbChunk) -> bool {
        if let Some(entry_type) = self.entry_type {
            if chunk.entry_type != entry_type {
                return false;
            }
        }
        if !self.user_types.is_empty() && !self.user_types.contains(&chunk.user_type) {
            return false;
        }
        if let Some(category) = &self.category {
            if &chunk.category != category {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(entry_type: EntryType, user_type: UserType, category: &str) -> KbChunk {
        KbChunk {
            chunk_id: "c1".into(),
            parent_entry_id: "p1".into(),
            parent_title: "Title".into(),
            content: "body".into(),
            section_label: "Intro".into(),
            chunk_index: 0,
            total_chunks: 1,
            entry_type,
            user_type,
            category: category.into(),
            related_documents: BTreeSet::new(),
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = MetadataFilter {
            entry_type: Some(EntryType::HowTo),
            user_types: vec![UserType::External, UserType::Both],
            category: Some("media".into()),
        };
        assert!(filter.matches(&chunk(EntryType::HowTo, UserType::Both, "media")));
        assert!(!filter.matches(&chunk(EntryType::Error, UserType::Both, "media")));
        assert!(!filter.matches(&chunk(EntryType::HowTo, UserType::Internal, "media")));
        assert!(!filter.matches(&chunk(EntryType::HowTo, UserType::Both, "billing")));
    }

    #[test]
    fn test_entry_type_round_trip() {
        for entry_type in [EntryType::HowTo, EntryType::Error, EntryType::Definition, EntryType::Workflow] {
            assert_eq!(EntryType::parse(&entry_type.to_string()), Some(entry_type));
        }
        assert_eq!(EntryType::parse("howto"), None);
    }
}
