use crate::error::{PixError, Result};
use serde::{Deserialize, Serialize};

/// Target repository configuration.
///
/// Everything the core needs to talk to one remote repository: API base,
/// coordinates, token, and the well-known location of the tag document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub token: String,
    /// Hidden directory holding repository metadata (tag document)
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
    /// Default destination directory for uploads; "/" means repository root
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub committer: Option<CommitterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitterConfig {
    pub name: String,
    pub email: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_metadata_dir() -> String {
    ".pixio".to_string()
}

fn default_upload_dir() -> String {
    "/".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl RepoConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PIXIO"))
            .build()
            .map_err(|e| PixError::Config(e.to_string()))?;

        let config: RepoConfig = settings
            .try_deserialize()
            .map_err(|e| PixError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Whether the credentials required for any remote call are present.
    pub fn credentials_complete(&self) -> bool {
        !self.owner.trim().is_empty()
            && !self.repo.trim().is_empty()
            && !self.token.trim().is_empty()
    }

    /// Repository-relative path of the tag document.
    pub fn document_path(&self) -> String {
        format!("{}/tags.json", self.metadata_dir.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal() -> RepoConfig {
        RepoConfig {
            api_base: default_api_base(),
            owner: "octo".to_string(),
            repo: "images".to_string(),
            branch: "main".to_string(),
            token: "tok".to_string(),
            metadata_dir: ".pixio".to_string(),
            upload_dir: "/".to_string(),
            timeout_secs: 30,
            committer: None,
        }
    }

    #[test]
    fn test_credentials_complete() {
        let mut config = minimal();
        assert!(config.credentials_complete());

        config.token = "  ".to_string();
        assert!(!config.credentials_complete());

        config.token = "tok".to_string();
        config.owner = String::new();
        assert!(!config.credentials_complete());
    }

    #[test]
    fn test_document_path() {
        let mut config = minimal();
        assert_eq!(config.document_path(), ".pixio/tags.json");

        config.metadata_dir = ".meta/".to_string();
        assert_eq!(config.document_path(), ".meta/tags.json");
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixio.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "owner: octo").unwrap();
        writeln!(file, "repo: images").unwrap();
        writeln!(file, "token: tok").unwrap();

        let config = RepoConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.branch, "main");
        assert_eq!(config.metadata_dir, ".pixio");
        assert_eq!(config.timeout_secs, 30);
        assert!(config.committer.is_none());
    }
}
