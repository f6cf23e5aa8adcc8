//! External tool process: spawning, output capture and forced termination.
//!
//! Each tool runs through `sh -c` in its own process group, so a kill
//! reaches every child the tool forks. Stdout and stderr are drained
//! continuously into a bounded buffer that progress queries consume; stdin
//! stays open so a query can nudge tools that print status on a keypress.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;

/// Maximum buffered output between two progress queries (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Read size for the output pumps.
const READ_CHUNK: usize = 4096;

/// Output produced since the last progress query.
#[derive(Debug, Default)]
struct OutputBuffer {
    pending: String,
    truncated: usize,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
        if self.pending.len() > MAX_OUTPUT_SIZE {
            // Keep the newest output.
            let cut = ceil_char_boundary(&self.pending, self.pending.len() - MAX_OUTPUT_SIZE);
            self.truncated += cut;
            self.pending.drain(..cut);
        }
    }

    fn take(&mut self) -> String {
        let out = std::mem::take(&mut self.pending);
        let dropped = std::mem::take(&mut self.truncated);
        if dropped > 0 {
            format!("... [truncated {dropped} bytes] ...\n{out}")
        } else {
            out
        }
    }
}

struct SharedOutput {
    buffer: Mutex<OutputBuffer>,
    notify: Notify,
}

/// Read side of a process's captured output. Outlives the process.
#[derive(Clone)]
pub struct OutputReader {
    shared: Arc<SharedOutput>,
}

impl OutputReader {
    /// Output produced since the previous read. Waits at most `wait` for new
    /// output when none is buffered; returns an empty string if nothing
    /// arrives.
    pub async fn read(&self, wait: Duration) -> String {
        let output = self.shared.take();
        if !output.is_empty() {
            return output;
        }
        let _ = tokio::time::timeout(wait, self.shared.notify.notified()).await;
        self.shared.take()
    }
}

impl SharedOutput {
    fn push(&self, chunk: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
        self.notify.notify_one();
    }

    fn take(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A running tool process.
pub struct ToolProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output: Arc<SharedOutput>,
}

impl std::fmt::Debug for ToolProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolProcess").field("pid", &self.pid).finish()
    }
}

impl ToolProcess {
    /// Spawn `command_line` through the shell.
    pub fn spawn(command_line: &str) -> std::io::Result<Self> {
        let mut command = Command::new("sh");
        command
            .args(["-c", command_line])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let output = Arc::new(SharedOutput {
            buffer: Mutex::new(OutputBuffer::default()),
            notify: Notify::new(),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Arc::clone(&output)));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            pid,
            output,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Write a newline to the tool's stdin. Tools that closed their stdin
    /// are left alone from then on.
    pub async fn nudge(&mut self) {
        if let Some(stdin) = self.stdin.as_mut()
            && (stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err())
        {
            self.stdin = None;
        }
    }

    pub fn output(&self) -> OutputReader {
        OutputReader {
            shared: Arc::clone(&self.output),
        }
    }

    /// Kill the whole process group and wait until the process is gone.
    pub async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid
                && let Err(e) = signal_group(pid, libc::SIGKILL)
            {
                tracing::warn!(pid, error = %e, "Failed to kill process group");
            }
        }
        // Covers non-unix targets and a leader that left its group.
        let _ = self.child.start_kill();
        self.child.wait().await
    }
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the shell; take its children with it.
        #[cfg(unix)]
        {
            if let Ok(None) = self.child.try_wait()
                && let Some(pid) = self.pid
            {
                let _ = signal_group(pid, libc::SIGKILL);
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let Ok(pid) = i32::try_from(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "pid out of range",
        ));
    };
    let result = unsafe { libc::kill(-pid, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Human readable description of an exit status.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "terminated abnormally".to_string()
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: Arc<SharedOutput>) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    output.push(&text);
                }
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        output.push(&rest);
    }
}

/// Lossy UTF-8 decoding of a byte stream read in arbitrary chunks. A
/// character split across two reads is held back until it is complete.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Smallest byte index >= `i` that is a valid char boundary.
fn ceil_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_exit() {
        let mut process = ToolProcess::spawn("exit 0").unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(describe_exit(&status), "exit code 0");
    }

    #[tokio::test]
    async fn failing_exit_is_described() {
        let mut process = ToolProcess::spawn("exit 3").unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(describe_exit(&status), "exit code 3");
    }

    #[tokio::test]
    async fn progress_returns_new_output_only() {
        let mut process = ToolProcess::spawn("while read line; do echo tick; done").unwrap();
        let reader = process.output();

        process.nudge().await;
        let first = reader.read(Duration::from_secs(2)).await;
        assert!(first.contains("tick"), "got {first:?}");
        assert_eq!(reader.read(Duration::ZERO).await, "");

        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn progress_without_output_is_empty() {
        let mut process = ToolProcess::spawn("exec 0<&-; sleep 5").unwrap();
        process.nudge().await;
        let out = process.output().read(Duration::from_millis(100)).await;
        assert_eq!(out, "");
        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_kills_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late.txt");
        // The background child would write the marker if it survived.
        let cmd = format!(
            "trap '' TERM; (sleep 1; touch {}) & sleep 30",
            marker.display()
        );
        let mut process = ToolProcess::spawn(&cmd).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let status = process.terminate().await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn output_buffer_keeps_newest() {
        let mut buffer = OutputBuffer::default();
        buffer.push(&"a".repeat(MAX_OUTPUT_SIZE));
        buffer.push("tail");
        let out = buffer.take();
        assert!(out.starts_with("... [truncated 4 bytes]"));
        assert!(out.ends_with("tail"));
        assert_eq!(buffer.take(), "");
    }

    #[test]
    fn split_character_survives_chunking() {
        let bytes = "façade ✓".as_bytes();
        // Cut inside the two-byte ç and inside the three-byte ✓.
        let mut decoder = Utf8Decoder::default();
        let mut out = decoder.decode(&bytes[..3]);
        assert_eq!(out, "fa");
        out.push_str(&decoder.decode(&bytes[3..10]));
        out.push_str(&decoder.decode(&bytes[10..]));
        out.push_str(&decoder.finish());
        assert_eq!(out, "façade ✓");
    }

    #[test]
    fn truncated_stream_ends_lossy() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'o', b'k', 0xE2, 0x9C]), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_ceil_char_boundary() {
        let s = "café";
        assert_eq!(ceil_char_boundary(s, 4), 5); // inside é → end
        assert_eq!(ceil_char_boundary(s, 3), 3);
        assert_eq!(ceil_char_boundary(s, 100), 5);
    }
}
