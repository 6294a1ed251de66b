//! Credential file written by the login collaborator

use std::path::{Path, PathBuf};

use super::SessionError;

/// Plain-text file holding the session cookie
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the token, `None` when the file is missing or blank
    pub async fn read_token(&self) -> Result<Option<String>, SessionError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let token = content.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SessionError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persist a token supplied through the control interface
    pub async fn write_token(&self, token: &str) -> Result<(), SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SessionError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&self.path, format!("{token}\n"))
            .await
            .map_err(|source| SessionError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("absent.txt"));
        assert!(store.read_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/cookie.txt"));

        store.write_token("  session_id=abc;  ").await.unwrap();
        assert_eq!(store.read_token().await.unwrap().as_deref(), Some("session_id=abc;"));
    }

    #[tokio::test]
    async fn test_blank_token_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie.txt"));
        store.write_token("session_id=keep").await.unwrap();

        assert!(matches!(
            store.write_token(" \n ").await,
            Err(SessionError::EmptyToken)
        ));
        assert_eq!(store.read_token().await.unwrap().as_deref(), Some("session_id=keep"));
    }

    #[tokio::test]
    async fn test_blank_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie.txt");
        std::fs::write(&path, "\n  \n").unwrap();
        assert!(CredentialStore::new(path).read_token().await.unwrap().is_none());
    }
}
