use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SCHEMA_VERSION: &str = "1.0.0";

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// The per-repository tag document: one JSON object mapping image paths to
/// tag lists, persisted as a single versioned blob.
///
/// Path keys are repository-relative and never carry a leading slash. An
/// empty tag list and an absent key both mean "untagged". The image map is
/// a `BTreeMap` so two documents with equal content always encode to the
/// same bytes, which the no-op write detection relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub images: BTreeMap<String, Vec<String>>,
}

/// Usage count for one tag, for the statistics view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl TagDocument {
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            last_updated: Utc::now(),
            images: BTreeMap::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encoded form written to the remote (2-space indented JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn tags_for(&self, path: &str) -> Vec<String> {
        self.images
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_tags(&mut self, path: &str, tags: Vec<String>) {
        self.images.insert(normalize_path(path), tags);
        self.last_updated = Utc::now();
    }

    pub fn remove_path(&mut self, path: &str) {
        self.images.remove(&normalize_path(path));
        self.last_updated = Utc::now();
    }

    /// The document to persist after a local mutation: the local image map
    /// wins unconditionally, the schema version is inherited from the
    /// remote copy when one exists, and the timestamp is refreshed.
    pub fn merged_onto(&self, remote: Option<&TagDocument>) -> TagDocument {
        TagDocument {
            version: remote
                .map(|r| r.version.clone())
                .unwrap_or_else(|| self.version.clone()),
            last_updated: Utc::now(),
            images: self.images.clone(),
        }
    }

    /// Canonical timestamp-stripped encoding used to detect writes that
    /// would not change the remote semantically.
    pub fn normalized_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("lastUpdated");
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// All distinct tags in use, sorted.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .images
            .values()
            .flatten()
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        tags.sort();
        tags
    }

    /// Per-tag usage counts, most used first (ties sorted by tag).
    pub fn tag_statistics(&self) -> Vec<TagCount> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for tags in self.images.values() {
            for tag in tags {
                *counts.entry(tag.as_str()).or_default() += 1;
            }
        }
        let mut stats: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, count)| TagCount {
                tag: tag.to_string(),
                count,
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        stats
    }
}
