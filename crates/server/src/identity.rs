//! Flat-file identity provider (`identifier.plugin = "fileidentifier"`).
//!
//! System id and unit model are single-line files; the subject set is a
//! newline-separated file. The file carries no change notification of
//! its own, so [`FileIdentity::start_polling`] runs a background task
//! that re-reads it on an interval and feeds the subjects-changed
//! observers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use edgeiam_common::config::FileIdentifierParams;
use edgeiam_common::{IamError, Result};

use crate::collaborators::IdentityProvider;
use crate::shutdown::Shutdown;

const SUBJECTS_CHANGED_CAPACITY: usize = 16;

/// Interval between subject-file polls.
const SUBJECTS_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct FileIdentity {
    system_id_path: PathBuf,
    unit_model_path: PathBuf,
    subjects_path: PathBuf,
    subjects: Mutex<Vec<String>>,
    changed_tx: broadcast::Sender<Vec<String>>,
}

impl FileIdentity {
    pub fn new(params: &FileIdentifierParams) -> Result<Self> {
        let subjects_path = PathBuf::from(&params.subjects_path);
        let subjects = read_subjects(&subjects_path);
        let (changed_tx, _) = broadcast::channel(SUBJECTS_CHANGED_CAPACITY);

        Ok(Self {
            system_id_path: PathBuf::from(&params.system_id_path),
            unit_model_path: PathBuf::from(&params.unit_model_path),
            subjects_path,
            subjects: Mutex::new(subjects),
            changed_tx,
        })
    }

    /// Spawns the subject-file poll task. It re-reads the file every
    /// [`SUBJECTS_POLL_INTERVAL`] and ends on shutdown.
    pub fn start_polling(self: Arc<Self>, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        let identity = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(SUBJECTS_POLL_INTERVAL) => identity.reload_subjects(),
                }
            }
        })
    }

    /// Re-reads the subjects file; observers are notified when the set
    /// actually changed.
    pub fn reload_subjects(&self) {
        let fresh = read_subjects(&self.subjects_path);
        let changed = {
            let mut current = self.subjects.lock();
            if *current == fresh {
                false
            } else {
                *current = fresh.clone();
                true
            }
        };

        if changed {
            debug!(count = fresh.len(), "subjects changed");
            let _ = self.changed_tx.send(fresh);
        }
    }
}

fn read_first_line(path: &PathBuf, what: &str) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|_| IamError::not_found(format!("can't read {what}: {}", path.display())))?;

    raw.lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| IamError::not_found(format!("{what} file is empty: {}", path.display())))
}

fn read_subjects(path: &PathBuf) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl IdentityProvider for FileIdentity {
    async fn system_id(&self) -> Result<String> {
        read_first_line(&self.system_id_path, "system id")
    }

    async fn unit_model(&self) -> Result<String> {
        read_first_line(&self.unit_model_path, "unit model")
    }

    async fn subjects(&self) -> Result<Vec<String>> {
        Ok(self.subjects.lock().clone())
    }

    fn subscribe_subjects_changed(&self) -> broadcast::Receiver<Vec<String>> {
        self.changed_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dir: &tempfile::TempDir) -> FileIdentity {
        std::fs::write(dir.path().join("system-id"), "SYS-0001\n").unwrap();
        std::fs::write(dir.path().join("unit-model"), "edge-gw-3\n").unwrap();
        std::fs::write(dir.path().join("subjects"), "a\nb\nc\n").unwrap();

        FileIdentity::new(&FileIdentifierParams {
            system_id_path: dir.path().join("system-id").display().to_string(),
            unit_model_path: dir.path().join("unit-model").display().to_string(),
            subjects_path: dir.path().join("subjects").display().to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_reads_identity_files() {
        let dir = tempfile::tempdir().unwrap();
        let identity = provider(&dir);

        assert_eq!(identity.system_id().await.unwrap(), "SYS-0001");
        assert_eq!(identity.unit_model().await.unwrap(), "edge-gw-3");
        assert_eq!(identity.subjects().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_missing_system_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let identity = provider(&dir);
        std::fs::remove_file(dir.path().join("system-id")).unwrap();

        let err = identity.system_id().await.unwrap_err();
        assert_eq!(err.kind(), edgeiam_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_missing_subjects_file_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let identity = FileIdentity::new(&FileIdentifierParams {
            system_id_path: dir.path().join("system-id").display().to_string(),
            unit_model_path: dir.path().join("unit-model").display().to_string(),
            subjects_path: dir.path().join("nope").display().to_string(),
        })
        .unwrap();

        assert!(identity.subjects().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(provider(&dir));
        let mut rx = identity.subscribe_subjects_changed();

        let shutdown = Shutdown::new();
        let poller = identity.clone().start_polling(shutdown.clone());

        std::fs::write(dir.path().join("subjects"), "x\ny\n").unwrap();

        let subjects = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("poll within the interval")
            .unwrap();
        assert_eq!(subjects, vec!["x", "y"]);

        shutdown.trigger();
        poller.await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_notifies_on_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let identity = provider(&dir);
        let mut rx = identity.subscribe_subjects_changed();

        // Same content: no event.
        identity.reload_subjects();
        assert!(rx.try_recv().is_err());

        std::fs::write(dir.path().join("subjects"), "a\nd\n").unwrap();
        identity.reload_subjects();
        assert_eq!(rx.try_recv().unwrap(), vec!["a", "d"]);
        assert_eq!(identity.subjects().await.unwrap(), vec!["a", "d"]);
    }
}
