//! Versioned reference keyframes, one history per scenario.
//!
//! ```text
//! <root>/index.sqlite3
//! <root>/<scenario>/v000001/keyframes.json
//! <root>/<scenario>/v000001/manifest.json
//! ```
//!
//! A version directory is immutable once published. The index decides which
//! version is current.

pub mod store;

pub use store::{BaselineStore, PromoteRequest};

use crate::replay::KeyframeSet;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INDEX_FILE: &str = "index.sqlite3";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

pub fn version_dir_name(version: u32) -> String {
    format!("v{version:06}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineManifest {
    pub format_version: u32,
    pub scenario: String,
    pub version: u32,
    /// sha256 of the version's `keyframes.json` bytes.
    pub keyframes_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<String>,
    pub created_unix_ms: i64,
    pub labels: Vec<String>,
    /// Version whose other labels were carried over by a partial promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub manifest: BaselineManifest,
    pub keyframes: KeyframeSet,
}

impl Baseline {
    pub fn version(&self) -> u32 {
        self.manifest.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_directories_sort_lexically() {
        assert_eq!(version_dir_name(7), "v000007");
        assert!(version_dir_name(10) > version_dir_name(9));
    }
}
