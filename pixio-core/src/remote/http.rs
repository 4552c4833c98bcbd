//! HTTP implementation of [`RemoteRepository`] for GitHub-style APIs

use super::{
    BranchHead, ObjectHandle, PutObject, PutResponse, RemoteRepository, TreeEntry, TreeItem,
    is_cas_conflict,
};
use crate::config::{CommitterConfig, RepoConfig};
use crate::error::{PixError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug)]
pub struct HttpRemote {
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: String,
    committer: Option<CommitterConfig>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ContentsFile {
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutPayload {
    #[serde(default)]
    content: Option<ContentsFile>,
}

#[derive(Debug, Deserialize)]
struct ShaPayload {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreePayload {
    tree: Vec<TreeItem>,
}

#[derive(Debug, Deserialize)]
struct BranchPayload {
    commit: BranchCommit,
}

#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
    commit: BranchCommitInner,
}

#[derive(Debug, Deserialize)]
struct BranchCommitInner {
    tree: ShaPayload,
}

impl HttpRemote {
    pub fn new(config: &RepoConfig) -> Result<Self> {
        if !config.credentials_complete() {
            return Err(PixError::Config(
                "owner, repo and token are required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            token: config.token.clone(),
            committer: config.committer.clone(),
            http,
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.owner,
            self.repo,
            path.trim_start_matches('/')
        )
    }

    fn git_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/git/{}",
            self.api_base, self.owner, self.repo, tail
        )
    }

    fn prepare(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
            .header("Accept", "application/vnd.github.v3+json")
    }

    /// Extract the remote's error message, falling back to the status text.
    async fn remote_error(resp: reqwest::Response) -> PixError {
        let status = resp.status().as_u16();
        let message = Self::message_of(resp).await;
        PixError::Remote { status, message }
    }

    async fn message_of(resp: reqwest::Response) -> String {
        let status = resp.status();
        match resp.json::<serde_json::Value>().await {
            Ok(value) => value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string(),
            Err(_) => status.to_string(),
        }
    }
}

fn decode_content(encoded: &str) -> Result<Bytes> {
    // The API wraps base64 content at 60 columns; strip the line breaks.
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| PixError::Encoding(e.to_string()))?;
    Ok(Bytes::from(bytes))
}

#[async_trait]
impl RemoteRepository for HttpRemote {
    async fn get_object(&self, path: &str) -> Result<Option<ObjectHandle>> {
        let url = self.contents_url(path);
        let resp = self
            .prepare(self.http.get(&url))
            .header("Cache-Control", "no-cache")
            .query(&[("ref", self.branch.as_str())])
            // Cache buster: handles must always reflect the current remote
            // state, a stale sha guarantees a conflict on the next write.
            .query(&[("ts", chrono::Utc::now().timestamp_millis())])
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {
                let file: ContentsFile = resp.json().await?;
                let content = match file.content.as_deref() {
                    Some(encoded) => decode_content(encoded)?,
                    None => Bytes::new(),
                };
                Ok(Some(ObjectHandle {
                    path: file.path,
                    sha: file.sha,
                    content,
                }))
            }
            404 => Ok(None),
            _ => Err(Self::remote_error(resp).await),
        }
    }

    async fn put_object(&self, path: &str, body: &PutObject) -> Result<PutResponse> {
        let url = self.contents_url(path);

        let mut payload = json!({
            "message": body.message,
            "content": BASE64.encode(&body.content),
            "branch": self.branch,
        });
        if let Some(sha) = &body.sha {
            payload["sha"] = json!(sha);
        }
        if let Some(committer) = &self.committer {
            payload["committer"] = json!({
                "name": committer.name,
                "email": committer.email,
            });
        }

        let resp = self
            .prepare(self.http.put(&url))
            .json(&payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            let put: PutPayload = resp.json().await.unwrap_or(PutPayload { content: None });
            return Ok(match put.content {
                Some(file) => PutResponse::Committed(ObjectHandle {
                    path: file.path,
                    sha: file.sha,
                    content: body.content.clone(),
                }),
                None => PutResponse::Ambiguous,
            });
        }

        let message = Self::message_of(resp).await;
        if is_cas_conflict(status, &message) {
            return Ok(PutResponse::Conflict { message });
        }
        Err(PixError::Remote { status, message })
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let url = self.git_url("blobs");
        let resp = self
            .prepare(self.http.post(&url))
            .json(&json!({
                "content": BASE64.encode(content),
                "encoding": "base64",
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        let payload: ShaPayload = resp.json().await?;
        Ok(payload.sha)
    }

    async fn get_tree(&self, sha: &str) -> Result<Vec<TreeItem>> {
        let url = self.git_url(&format!("trees/{}", sha));
        let resp = self
            .prepare(self.http.get(&url))
            .query(&[("recursive", "1")])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        let payload: TreePayload = resp.json().await?;
        Ok(payload.tree)
    }

    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String> {
        let url = self.git_url("trees");

        let tree: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "path": entry.path,
                    "mode": "100644",
                    "type": "blob",
                    "sha": entry.sha,
                })
            })
            .collect();
        let mut payload = json!({ "tree": tree });
        if let Some(base) = base_tree {
            payload["base_tree"] = json!(base);
        }

        let resp = self
            .prepare(self.http.post(&url))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        let payload: ShaPayload = resp.json().await?;
        Ok(payload.sha)
    }

    async fn create_commit(&self, tree: &str, parent: &str, message: &str) -> Result<String> {
        let url = self.git_url("commits");
        let resp = self
            .prepare(self.http.post(&url))
            .json(&json!({
                "tree": tree,
                "parents": [parent],
                "message": message,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        let payload: ShaPayload = resp.json().await?;
        Ok(payload.sha)
    }

    async fn update_ref(&self, branch: &str, commit_sha: &str) -> Result<()> {
        let url = self.git_url(&format!("refs/heads/{}", branch));
        let resp = self
            .prepare(self.http.patch(&url))
            // Forced: tolerate benign races with concurrent external history
            // changes instead of failing on non-fast-forward.
            .json(&json!({ "sha": commit_sha, "force": true }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        Ok(())
    }

    async fn get_branch(&self, branch: &str) -> Result<BranchHead> {
        let url = format!(
            "{}/repos/{}/{}/branches/{}",
            self.api_base, self.owner, self.repo, branch
        );
        let resp = self.prepare(self.http.get(&url)).send().await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        let payload: BranchPayload = resp.json().await?;
        Ok(BranchHead {
            commit_sha: payload.commit.sha,
            tree_sha: payload.commit.commit.tree.sha,
        })
    }
}
