//! Persistence collaborator used by the domain managers.
//!
//! The trait is synchronous; async callers go through [`call_with_timeout`],
//! which runs the call on the blocking pool and bounds it by the configured
//! I/O timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{RepositoryConfig, RepositoryKind};
use crate::errors::RepositoryError;

pub trait Repository: Send + Sync {
    fn save_results(&self, pipeline_id: &str, domain: &str, results: &Value) -> Result<(), RepositoryError>;

    fn update_status(&self, pipeline_id: &str, status: &str, progress: u8) -> Result<(), RepositoryError>;

    fn log_error(&self, pipeline_id: &str, error: &str, stage: &str) -> Result<(), RepositoryError>;
}

/// One persisted call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RecordKind {
    Results { domain: String, results: Value },
    Status { status: String, progress: u8 },
    Error { error: String, stage: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub pipeline_id: String,
    #[serde(flatten)]
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
}

impl RepositoryRecord {
    fn new(pipeline_id: &str, kind: RecordKind) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct InMemoryRepository {
    records: Mutex<Vec<RepositoryRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: RepositoryRecord) -> Result<(), RepositoryError> {
        self.records
            .lock()
            .map_err(|_| RepositoryError::LockPoisoned)?
            .push(record);
        Ok(())
    }

    pub fn entries(&self) -> Vec<RepositoryRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, pipeline_id: &str) -> Vec<RepositoryRecord> {
        self.entries()
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .collect()
    }
}

impl Repository for InMemoryRepository {
    fn save_results(&self, pipeline_id: &str, domain: &str, results: &Value) -> Result<(), RepositoryError> {
        self.push(RepositoryRecord::new(
            pipeline_id,
            RecordKind::Results {
                domain: domain.to_string(),
                results: results.clone(),
            },
        ))
    }

    fn update_status(&self, pipeline_id: &str, status: &str, progress: u8) -> Result<(), RepositoryError> {
        self.push(RepositoryRecord::new(
            pipeline_id,
            RecordKind::Status {
                status: status.to_string(),
                progress,
            },
        ))
    }

    fn log_error(&self, pipeline_id: &str, error: &str, stage: &str) -> Result<(), RepositoryError> {
        self.push(RepositoryRecord::new(
            pipeline_id,
            RecordKind::Error {
                error: error.to_string(),
                stage: stage.to_string(),
            },
        ))
    }
}

/// Append-only JSON-lines log, one record per call.
pub struct FileRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRepository {
    pub const FILE_NAME: &'static str = "records.jsonl";

    /// Open (creating if needed) the log inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, RepositoryError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &RepositoryRecord) -> Result<(), RepositoryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RepositoryError::LockPoisoned)?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(line.as_bytes())?;
        Ok(())
    }

    /// Every record in write order. Lines that do not parse are skipped.
    pub fn entries(&self) -> Result<Vec<RepositoryRecord>, RepositoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    pub fn entries_for(&self, pipeline_id: &str) -> Result<Vec<RepositoryRecord>, RepositoryError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .collect())
    }
}

impl Repository for FileRepository {
    fn save_results(&self, pipeline_id: &str, domain: &str, results: &Value) -> Result<(), RepositoryError> {
        self.append(&RepositoryRecord::new(
            pipeline_id,
            RecordKind::Results {
                domain: domain.to_string(),
                results: results.clone(),
            },
        ))
    }

    fn update_status(&self, pipeline_id: &str, status: &str, progress: u8) -> Result<(), RepositoryError> {
        self.append(&RepositoryRecord::new(
            pipeline_id,
            RecordKind::Status {
                status: status.to_string(),
                progress,
            },
        ))
    }

    fn log_error(&self, pipeline_id: &str, error: &str, stage: &str) -> Result<(), RepositoryError> {
        self.append(&RepositoryRecord::new(
            pipeline_id,
            RecordKind::Error {
                error: error.to_string(),
                stage: stage.to_string(),
            },
        ))
    }
}

/// Build the repository selected by configuration. A relative directory is
/// resolved against `base_dir`.
pub fn from_config(config: &RepositoryConfig, base_dir: &Path) -> Result<Arc<dyn Repository>, RepositoryError> {
    match config.kind {
        RepositoryKind::Memory => Ok(Arc::new(InMemoryRepository::new())),
        RepositoryKind::File => {
            let dir = if config.dir.is_absolute() {
                config.dir.clone()
            } else {
                base_dir.join(&config.dir)
            };
            Ok(Arc::new(FileRepository::open(&dir)?))
        }
    }
}

/// Run a repository call on the blocking pool, bounded by `timeout`.
pub async fn call_with_timeout<T, F>(
    repository: &Arc<dyn Repository>,
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, RepositoryError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Repository) -> Result<T, RepositoryError> + Send + 'static,
{
    let repository = Arc::clone(repository);
    let task = tokio::task::spawn_blocking(move || call(repository.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(RepositoryError::Join(join.to_string())),
        Err(_) => Err(RepositoryError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_records_every_call() {
        let repo = InMemoryRepository::new();
        repo.update_status("p1", "quality.detection.started", 0).unwrap();
        repo.save_results("p1", "quality", &json!({"score": 1})).unwrap();
        repo.log_error("p2", "boom", "insight").unwrap();

        assert_eq!(repo.entries().len(), 3);
        let p1 = repo.entries_for("p1");
        assert_eq!(p1.len(), 2);
        assert_eq!(
            p1[1].kind,
            RecordKind::Results {
                domain: "quality".into(),
                results: json!({"score": 1})
            }
        );
    }

    #[test]
    fn test_file_repository_appends_json_lines() {
        let dir = tempdir().unwrap();
        let repo = FileRepository::open(&dir.path().join("nested")).unwrap();
        assert!(repo.entries().unwrap().is_empty());

        repo.save_results("p1", "report", &json!({"title": "t"})).unwrap();
        repo.log_error("p1", "render failed", "report").unwrap();
        repo.update_status("p2", "running", 40).unwrap();

        let content = fs::read_to_string(repo.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        let first: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["record"], "results");
        assert_eq!(first["pipeline_id"], "p1");

        let p1 = repo.entries_for("p1").unwrap();
        assert_eq!(p1.len(), 2);
        assert!(matches!(p1[1].kind, RecordKind::Error { .. }));
    }

    #[test]
    fn test_file_repository_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let repo = FileRepository::open(dir.path()).unwrap();
        repo.update_status("p1", "running", 10).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(repo.path())
            .unwrap()
            .write_all(b"not json\n\n")
            .unwrap();
        repo.update_status("p1", "running", 20).unwrap();
        assert_eq!(repo.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_from_config_resolves_relative_dir() {
        let dir = tempdir().unwrap();
        let config = RepositoryConfig {
            kind: RepositoryKind::File,
            dir: PathBuf::from("store"),
            ..RepositoryConfig::default()
        };
        let repo = from_config(&config, dir.path()).unwrap();
        repo.log_error("p1", "x", "quality").unwrap();
        assert!(dir.path().join("store").join(FileRepository::FILE_NAME).exists());
    }

    struct SlowRepository;

    impl Repository for SlowRepository {
        fn save_results(&self, _: &str, _: &str, _: &Value) -> Result<(), RepositoryError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }

        fn update_status(&self, _: &str, _: &str, _: u8) -> Result<(), RepositoryError> {
            Ok(())
        }

        fn log_error(&self, _: &str, _: &str, _: &str) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_call_with_timeout_bounds_slow_calls() {
        let repo: Arc<dyn Repository> = Arc::new(SlowRepository);
        let err = call_with_timeout(&repo, "save_results", Duration::from_millis(20), |r| {
            r.save_results("p1", "quality", &Value::Null)
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Timeout {
                operation: "save_results",
                timeout_ms: 20
            }
        ));

        call_with_timeout(&repo, "update_status", Duration::from_secs(1), |r| {
            r.update_status("p1", "running", 1)
        })
        .await
        .unwrap();
    }
}
