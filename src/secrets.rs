//! Secret resolution.
//!
//! Secrets are referenced indirectly (`env:NAME`, `file:name`) and loaded
//! fresh at the point of use. The resolved value is never written to the
//! durable store; schedule rows carry only the reference.

use std::path::PathBuf;

use crate::error::{ControlError, Result};

/// Resolves secret references against the process environment and a
/// secrets directory.
pub struct SecretStore {
    secrets_dir: PathBuf,
}

impl SecretStore {
    pub fn new(secrets_dir: PathBuf) -> Self {
        Self { secrets_dir }
    }

    /// Load the secret behind `reference`.
    ///
    /// Supported forms:
    /// - `env:NAME` — read from the environment variable `NAME`
    /// - `file:name` — read the file `name` inside the secrets directory
    ///   (path components are rejected to keep lookups inside the directory)
    pub fn load(&self, reference: &str) -> Result<String> {
        let err = |message: String| ControlError::Secret {
            reference: reference.to_string(),
            message,
        };

        if let Some(name) = reference.strip_prefix("env:") {
            return std::env::var(name)
                .map_err(|_| err(format!("environment variable {} not set", name)));
        }

        if let Some(name) = reference.strip_prefix("file:") {
            if name.contains('/') || name.contains("..") {
                return Err(err("file reference must be a bare name".to_string()));
            }
            let path = self.secrets_dir.join(name);
            return std::fs::read_to_string(&path)
                .map(|s| s.trim_end().to_string())
                .map_err(|e| err(format!("read {}: {}", path.display(), e)));
        }

        Err(err("expected env: or file: prefix".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_reference() {
        std::env::set_var("OPSGATE_TEST_SECRET", "hunter2");
        let store = SecretStore::new(PathBuf::from("/nonexistent"));
        assert_eq!(store.load("env:OPSGATE_TEST_SECRET").unwrap(), "hunter2");
        assert!(store.load("env:OPSGATE_TEST_MISSING").is_err());
    }

    #[test]
    fn test_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("webhook-key"), "s3cret\n").unwrap();

        let store = SecretStore::new(dir.path().to_path_buf());
        assert_eq!(store.load("file:webhook-key").unwrap(), "s3cret");
        assert!(store.load("file:../escape").is_err());
        assert!(store.load("plain-name").is_err());
    }
}
