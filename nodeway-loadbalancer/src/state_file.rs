//! On-disk membership so a restarted agent can reach the cluster before
//! discovery catches up.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub server_url: String,
    pub server_addresses: Vec<String>,
}

/// `<data_dir>/etc/<service_name>.json`
#[must_use]
pub fn path(data_dir: &Path, service_name: &str) -> PathBuf {
    data_dir.join("etc").join(format!("{service_name}.json"))
}

/// Read persisted addresses for `server_url`.
///
/// Returns `None` if the file is missing, unreadable, or was written for a
/// different server URL.
pub async fn load(path: &Path, server_url: &str) -> Option<Vec<String>> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read load-balancer state");
            return None;
        }
    };

    let state: PersistedState = match serde_json::from_slice(&contents) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt load-balancer state");
            return None;
        }
    };

    if state.server_url != server_url {
        tracing::debug!(
            path = %path.display(),
            persisted = %state.server_url,
            current = %server_url,
            "Ignoring load-balancer state for a different server URL"
        );
        return None;
    }

    Some(state.server_addresses)
}

/// Write the state atomically (temp file + rename).
pub async fn store(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let contents = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(url: &str, addresses: &[&str]) -> PersistedState {
        PersistedState {
            server_url: url.to_string(),
            server_addresses: addresses.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_path() {
        assert_eq!(
            path(Path::new("/var/lib/agent"), "svc"),
            PathBuf::from("/var/lib/agent/etc/svc.json")
        );
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = path(dir.path(), "svc");
        store(&file, &state("https://10.0.0.1:9345", &["10.0.0.1:9345", "10.0.0.2:9345"])).await.unwrap();

        assert_eq!(
            load(&file, "https://10.0.0.1:9345").await,
            Some(vec!["10.0.0.1:9345".to_string(), "10.0.0.2:9345".to_string()])
        );
    }

    #[tokio::test]
    async fn test_load_ignores_other_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let file = path(dir.path(), "svc");
        store(&file, &state("https://10.0.0.1:9345", &["10.0.0.2:9345"])).await.unwrap();

        assert_eq!(load(&file, "https://10.0.0.9:9345").await, None);
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let file = path(dir.path(), "svc");
        assert_eq!(load(&file, "https://10.0.0.1:9345").await, None);

        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"{not json").unwrap();
        assert_eq!(load(&file, "https://10.0.0.1:9345").await, None);
    }
}
