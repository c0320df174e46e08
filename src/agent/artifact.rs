//! JSON artifacts exchanged with agent processes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::store::ReviewVerdict;

/// Directory inside a workspace that holds agent artifacts. Never committed.
pub const ARTIFACT_DIR: &str = ".taskforge";

pub fn workspace_artifact_dir(workspace: &Path) -> PathBuf {
    workspace.join(ARTIFACT_DIR)
}

pub fn input_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join("input.json")
}

pub fn result_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join("result.json")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// What a coding or review agent reports back. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub status: Option<ResultStatus>,
    pub verdict: Option<ReviewVerdict>,
    pub feedback: Option<String>,
    pub test_output: Option<String>,
    pub summary: Option<String>,
}

pub async fn write_input<T: Serialize>(path: &Path, input: &T) -> Result<(), AgentError> {
    let bytes = serde_json::to_vec_pretty(input).context("Failed to serialize agent input")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| AgentError::ArtifactWriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| AgentError::ArtifactWriteFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Remove a stale result left by an earlier invocation.
pub async fn clear_result(path: &Path) -> Result<(), AgentError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AgentError::ArtifactWriteFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read a result artifact. A missing file is `Ok(None)`; malformed JSON is
/// `InvalidResult`.
pub async fn read_result<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AgentError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AgentError::Other(
                anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
            ));
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| AgentError::InvalidResult(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_input_creates_artifact_dir() {
        let dir = tempdir().unwrap();
        let artifacts = workspace_artifact_dir(dir.path());
        let path = input_path(&artifacts);
        write_input(&path, &serde_json::json!({"phase": "coding"}))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"coding\""));
    }

    #[tokio::test]
    async fn test_read_result_missing_is_none() {
        let dir = tempdir().unwrap();
        let result: Option<AgentResult> = read_result(&result_path(dir.path())).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_result_parses_partial_fields() {
        let dir = tempdir().unwrap();
        let path = result_path(dir.path());
        std::fs::write(&path, r#"{"verdict": "reject", "feedback": "needs tests"}"#).unwrap();

        let result: AgentResult = read_result(&path).await.unwrap().unwrap();
        assert_eq!(result.verdict, Some(ReviewVerdict::Reject));
        assert_eq!(result.feedback.as_deref(), Some("needs tests"));
        assert!(result.status.is_none());

        clear_result(&path).await.unwrap();
        assert!(!path.exists());
        clear_result(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_result_malformed_is_invalid() {
        let dir = tempdir().unwrap();
        let path = result_path(dir.path());
        std::fs::write(&path, "not json").unwrap();
        let err = read_result::<AgentResult>(&path).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResult(_)));
    }
}
