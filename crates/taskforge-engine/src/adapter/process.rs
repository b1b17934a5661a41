//! Shared plumbing for subprocess-backed adapters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 40;

/// Generate an opaque thread id: `<prefix>-<unix-millis>-<8 hex>`.
pub fn new_thread_id(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{millis}-{}", &suffix[..8])
}

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line it completed (without `\n` / `\r\n`).
    /// Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
        let trimmed = rest.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Drop any buffered partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Bounded tail of stderr output.
#[derive(Debug)]
pub struct StderrTail {
    lines: VecDeque<String>,
    max: usize,
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::with_capacity(STDERR_TAIL_LINES)
    }
}

impl StderrTail {
    pub fn with_capacity(max: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max),
            max,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.max {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Drain a child's stderr into a shared tail, logging each line.
pub fn collect_stderr(stderr: ChildStderr, thread_id: String) -> Arc<Mutex<StderrTail>> {
    let tail = Arc::new(Mutex::new(StderrTail::default()));
    let sink = Arc::clone(&tail);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(thread_id = %thread_id, "stderr: {}", line);
            sink.lock().await.push(line);
        }
        debug!(thread_id = %thread_id, "stderr reader finished");
    });
    tail
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_child(child: &mut Child, grace: Duration, thread_id: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own Child handle, which has not been reaped yet.
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(thread_id, pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(thread_id, ?status, "Process exited after SIGTERM"),
        Ok(Err(e)) => {
            warn!(thread_id, error = %e, "Error waiting for process, killing");
            let _ = child.kill().await;
        }
        Err(_) => {
            warn!(thread_id, "Grace period expired, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_prefixed_and_unique() {
        let a = new_thread_id("codex");
        let b = new_thread_id("codex");
        assert!(a.starts_with("codex-"));
        assert_ne!(a, b);
        let suffix = a.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn partial_lines_carry_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(br#"{"type":"turn"#).is_empty());
        let lines = buf.push(b".started\"}\r\n{\"type\":\"x\"}\n\n{\"par");
        assert_eq!(lines, vec![r#"{"type":"turn.started"}"#, r#"{"type":"x"}"#]);
        assert_eq!(buf.finish().as_deref(), Some(r#"{"par"#));
        assert!(buf.finish().is_none());
    }

    #[test]
    fn multibyte_split_across_chunks() {
        let mut buf = LineBuffer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::with_capacity(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.render(), "b\nc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_child_stops_a_sleeping_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        terminate_child(&mut child, Duration::from_secs(2), "t").await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
