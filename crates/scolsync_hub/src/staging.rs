//! Store-and-forward staging for manual peer transfers.
//!
//! A transfer received over the LAN is written to disk and waits there until
//! the user explicitly accepts or discards it; nothing is ever applied
//! automatically.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One store-and-forward payload, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPayload {
    /// Human name of the sending instance.
    pub sender: String,
    /// What the transfer contains (e.g. `grades`, `class`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender clock, Unix millis; part of the file name.
    pub timestamp: u64,
    /// The transferred data, opaque to the hub.
    pub data: serde_json::Value,
}

/// A staged transfer awaiting a user decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTransfer {
    /// File name under the pending directory.
    pub filename: String,
    /// The stored payload.
    pub payload: TransferPayload,
}

/// The staging area on disk.
pub struct Staging {
    pending_dir: PathBuf,
}

impl Staging {
    /// Opens (and creates) the staging area under the given root.
    pub fn open(root: impl AsRef<Path>) -> HubResult<Self> {
        let pending_dir = root.as_ref().join("pending");
        fs::create_dir_all(&pending_dir)?;
        Ok(Self { pending_dir })
    }

    /// Persists a transfer; returns the file name.
    pub fn save(&self, payload: &TransferPayload) -> HubResult<String> {
        let filename = format!(
            "{}_{}.json",
            payload.timestamp,
            sanitize_sender(&payload.sender)
        );
        let body = serde_json::to_vec_pretty(payload)?;
        fs::write(self.pending_dir.join(&filename), body)?;
        tracing::info!(filename, sender = %payload.sender, "transfer staged");
        Ok(filename)
    }

    /// Lists every pending transfer. Unreadable files are skipped.
    pub fn list_pending(&self) -> HubResult<Vec<PendingTransfer>> {
        let mut pending = Vec::new();
        for entry in fs::read_dir(&self.pending_dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(".json") {
                continue;
            }
            match fs::read(entry.path())
                .map_err(HubError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(HubError::from))
            {
                Ok(payload) => pending.push(PendingTransfer { filename, payload }),
                Err(e) => {
                    tracing::warn!(filename, error = %e, "skipping unreadable transfer");
                }
            }
        }
        pending.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(pending)
    }

    /// Reads one pending transfer.
    pub fn content(&self, filename: &str) -> HubResult<Option<TransferPayload>> {
        let path = self.checked_path(filename)?;
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Discards one pending transfer. The explicit user decision.
    pub fn discard(&self, filename: &str) -> HubResult<()> {
        let path = self.checked_path(filename)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn checked_path(&self, filename: &str) -> HubResult<PathBuf> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return Err(HubError::InvalidName(filename.into()));
        }
        Ok(self.pending_dir.join(filename))
    }
}

/// Keeps sender names filesystem-safe: anything outside `[A-Za-z0-9]`
/// becomes an underscore.
fn sanitize_sender(sender: &str) -> String {
    sender
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(sender: &str, timestamp: u64) -> TransferPayload {
        TransferPayload {
            sender: sender.into(),
            kind: "grades".into(),
            timestamp,
            data: serde_json::json!({ "rows": [1, 2, 3] }),
        }
    }

    #[test]
    fn save_names_files_by_timestamp_and_sender() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::open(dir.path()).unwrap();

        let name = staging.save(&payload("Salle B (7A)", 1_700_000_000_000)).unwrap();
        assert_eq!(name, "1700000000000_Salle_B__7A_.json");
    }

    #[test]
    fn list_content_discard_cycle() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::open(dir.path()).unwrap();

        let first = staging.save(&payload("salle-a", 100)).unwrap();
        staging.save(&payload("salle-b", 200)).unwrap();

        let pending = staging.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].filename, first);
        assert_eq!(pending[0].payload.sender, "salle-a");

        let content = staging.content(&first).unwrap().unwrap();
        assert_eq!(content.kind, "grades");

        staging.discard(&first).unwrap();
        assert_eq!(staging.list_pending().unwrap().len(), 1);
        assert!(staging.content(&first).unwrap().is_none());
    }

    #[test]
    fn payload_survives_verbatim() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::open(dir.path()).unwrap();
        let original = payload("room", 42);

        let name = staging.save(&original).unwrap();
        let restored = staging.content(&name).unwrap().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::open(dir.path()).unwrap();
        assert!(staging.content("../outside.json").is_err());
        assert!(staging.discard("a/b.json").is_err());
    }

    #[test]
    fn wire_uses_type_field() {
        let parsed: TransferPayload = serde_json::from_str(
            r#"{"sender":"salle-a","type":"grades","timestamp":7,"data":{}}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, "grades");
    }
}
