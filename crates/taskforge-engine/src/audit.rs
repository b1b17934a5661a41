//! Append-only per-task audit log.
//!
//! One plain-text file per task, one line per transition. The file is
//! opened, appended and closed on every write so the manager and the
//! orchestrator can both write without sharing a handle.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::worktree::sanitize_task_id;

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<task-id>.log`, with the id sanitised like a worktree name.
    pub fn path_for(&self, task_id: &str) -> io::Result<PathBuf> {
        let name = sanitize_task_id(task_id)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(self.dir.join(format!("{name}.log")))
    }

    /// Append `[timestamp] [scope] message`. Newlines in `message` are
    /// flattened so every call is exactly one line.
    pub async fn append(&self, task_id: &str, scope: &str, message: &str) -> io::Result<()> {
        let path = self.path_for(task_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let line = format!(
            "[{}] [{scope}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message.replace(['\r', '\n'], " ")
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Whole log for a task; empty when nothing was written yet.
    pub async fn read(&self, task_id: &str) -> io::Result<String> {
        match tokio::fs::read_to_string(self.path_for(task_id)?).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(tmp.path().join("audit"));

        audit.append("task-1", "plan", "attempt 1 started").await.unwrap();
        audit
            .append("task-1", "plan", "output was:\nnot json")
            .await
            .unwrap();

        let text = audit.read("task-1").await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[plan] attempt 1 started"));
        assert!(lines[1].ends_with("output was: not json"));
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(tmp.path());
        assert_eq!(audit.read("nothing-yet").await.unwrap(), "");
    }

    #[test]
    fn path_traversal_is_rejected() {
        let audit = AuditLog::new("/tmp/audit");
        assert!(audit.path_for("..").is_err());
        assert_eq!(
            audit.path_for("a-b").unwrap(),
            PathBuf::from("/tmp/audit/a-b.log")
        );
        assert_ne!(audit.path_for("a/b").unwrap(), audit.path_for("a-b").unwrap());
    }
}
