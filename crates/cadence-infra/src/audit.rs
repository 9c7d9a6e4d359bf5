//! JSONL audit log: a persistence side-channel for engine events.
//!
//! `spawn_audit_writer` subscribes to the event bus and appends every
//! auditable event (resolved steps, planner thoughts, rejected actions, run
//! completion) to a file, one JSON object per line. Write failures are
//! logged and never reach the engine.

use std::path::{Path, PathBuf};

use cadence_types::event::EngineEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub recorded_at: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Errors from the audit writer itself.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Summary returned when the writer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub written: usize,
    pub lagged: u64,
    pub failed: usize,
}

/// Spawn a task appending auditable events from `receiver` to `path`.
///
/// The task ends when every sender of the bus has been dropped. Lagged
/// events are counted and logged; the writer never slows the bus down.
pub fn spawn_audit_writer(
    mut receiver: broadcast::Receiver<EngineEvent>,
    path: impl Into<PathBuf>,
) -> JoinHandle<AuditSummary> {
    let path = path.into();
    tokio::spawn(async move {
        let mut summary = AuditSummary::default();
        let mut file = match open_log(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(error = %e, "audit log disabled");
                None
            }
        };

        loop {
            match receiver.recv().await {
                Ok(event) if event.is_auditable() => {
                    let Some(out) = file.as_mut() else {
                        summary.failed += 1;
                        continue;
                    };
                    match append(out, &path, event).await {
                        Ok(()) => summary.written += 1,
                        Err(e) => {
                            summary.failed += 1;
                            tracing::warn!(error = %e, "failed to write audit record");
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    summary.lagged += n;
                    tracing::warn!(skipped = n, "audit writer lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }

        if let Some(out) = file.as_mut() {
            if let Err(e) = out.flush().await {
                tracing::warn!(path = %path.display(), error = %e, "failed to flush audit log");
            }
        }
        tracing::debug!(
            path = %path.display(),
            written = summary.written,
            lagged = summary.lagged,
            "audit writer stopped"
        );
        summary
    })
}

async fn open_log(path: &Path) -> Result<tokio::fs::File, AuditError> {
    let io_err = |source: std::io::Error| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)
}

async fn append(
    file: &mut tokio::fs::File,
    path: &Path,
    event: EngineEvent,
) -> Result<(), AuditError> {
    let record = AuditRecord {
        recorded_at: Utc::now(),
        event,
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read an audit log back (for replay and tests). Malformed lines are skipped.
pub async fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed audit line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use cadence_core::event::EventBus;
    use cadence_types::result::{RunStatus, StepResult};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn writes_only_auditable_events() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit").join("run.jsonl");
        let bus = EventBus::new(64);
        let handle = spawn_audit_writer(bus.subscribe(), &path);
        let query_id = Uuid::now_v7();

        bus.publish(EngineEvent::StepStarted {
            query_id,
            step_id: "a".into(),
            capability: "demo/echo".into(),
        });
        bus.publish(EngineEvent::StepResolved {
            query_id,
            result: StepResult::succeeded("a", json!("ok"), vec![], Duration::ZERO, 1),
        });
        bus.publish(EngineEvent::RunFinished {
            query_id,
            status: RunStatus::Succeeded,
            completed: 1,
            failed: 0,
            duration_ms: 3,
            termination: None,
        });
        drop(bus);

        let summary = handle.await.unwrap();
        assert_eq!(summary.written, 2);

        let records = read_audit_log(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].event, EngineEvent::StepResolved { .. }));
        assert!(matches!(records[1].event, EngineEvent::RunFinished { .. }));
        assert_eq!(records[1].event.query_id(), query_id);
    }

    #[tokio::test]
    async fn appends_across_writers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.jsonl");

        for _ in 0..2 {
            let bus = EventBus::new(16);
            let handle = spawn_audit_writer(bus.subscribe(), &path);
            bus.publish(EngineEvent::RunFinished {
                query_id: Uuid::now_v7(),
                status: RunStatus::Failed,
                completed: 0,
                failed: 1,
                duration_ms: 0,
                termination: None,
            });
            drop(bus);
            handle.await.unwrap();
        }

        assert_eq!(read_audit_log(&path).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unwritable_path_never_panics() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be.
        let path = tmp.path().to_path_buf();
        let bus = EventBus::new(16);
        let handle = spawn_audit_writer(bus.subscribe(), &path);
        bus.publish(EngineEvent::RunFinished {
            query_id: Uuid::now_v7(),
            status: RunStatus::Succeeded,
            completed: 1,
            failed: 0,
            duration_ms: 0,
            termination: None,
        });
        drop(bus);

        let summary = handle.await.unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.failed, 1);
    }
}
