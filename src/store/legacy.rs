//! One-shot migration of the legacy `STATE_FILE` JSON snapshot into the
//! sqlite store. Mirrors the teacher's `load_sessions`/`save_sessions`
//! legacy-YAML-migration pattern in `src/server/mod.rs`, adapted to JSON and
//! to this crate's `Session`/`ActiveSession` shapes.

use std::path::Path;

use serde::Deserialize;

use crate::error::BrokerError;
use crate::model::{ActiveSession, Session};
use crate::store::SqliteStore;

#[derive(Debug, Deserialize)]
struct LegacyStateFile {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default, rename = "activeSession")]
    active_session: Option<ActiveSession>,
}

/// Runs at most once: if the store has no active sessions yet and
/// `state_path` holds a parseable legacy snapshot, imports it and renames
/// the file to `<name>.migrated` so a restart never re-imports it. Returns
/// `true` if a migration happened.
pub async fn migrate_if_present(store: &SqliteStore, state_path: &Path) -> Result<bool, BrokerError> {
    if !store.list_active_sessions().await?.is_empty() {
        return Ok(false);
    }

    let contents = match std::fs::read_to_string(state_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            tracing::warn!(path = %state_path.display(), error = %err, "failed to read legacy state file");
            return Ok(false);
        }
    };

    let legacy: LegacyStateFile = match serde_json::from_str(&contents) {
        Ok(legacy) => legacy,
        Err(err) => {
            tracing::warn!(path = %state_path.display(), error = %err, "legacy state file did not parse, skipping migration");
            return Ok(false);
        }
    };

    let count = legacy.sessions.len();
    for session in legacy.sessions {
        store.upsert_active_session(session).await?;
    }
    store.set_active_session_pointer(legacy.active_session.as_ref()).await?;

    let migrated_path = state_path.with_extension("json.migrated");
    if let Err(err) = std::fs::rename(state_path, &migrated_path) {
        tracing::warn!(path = %state_path.display(), error = %err, "failed to rename legacy state file after migration");
    }

    tracing::info!(count, path = %state_path.display(), "migrated legacy state file into sqlite store");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ide;

    #[tokio::test]
    async fn migrates_legacy_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let session = Session::new("alice", "gemini", Ide::Vscode);
        let legacy = serde_json::json!({
            "sessions": [session],
            "activeSession": { "user": "alice", "cluster": "gemini", "ide": "vscode" },
        });
        std::fs::write(&path, serde_json::to_string(&legacy).unwrap()).unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let migrated = migrate_if_present(&store, &path).await.unwrap();
        assert!(migrated);
        assert!(!path.exists());
        assert!(path.with_extension("json.migrated").exists());

        let sessions = store.list_active_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        let pointer = store.get_active_session_pointer().await.unwrap().unwrap();
        assert_eq!(pointer.user, "alice");

        // Second call is a no-op: table is already non-empty.
        std::fs::write(&path, serde_json::to_string(&legacy).unwrap()).unwrap();
        let migrated_again = migrate_if_present(&store, &path).await.unwrap();
        assert!(!migrated_again);
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let migrated = migrate_if_present(&store, Path::new("/nonexistent/state.json")).await.unwrap();
        assert!(!migrated);
    }
}
