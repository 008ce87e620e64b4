//! PTY adapter.
//!
//! This module wraps `portable-pty` into the small surface the session table
//! needs: spawn a shell on a pseudo-terminal, write to it, resize it, kill it,
//! and receive its output and exit as an ordered stream of [`PtyEvent`]s.
//!
//! The table only sees the [`PtySpawner`] and [`PtyProcess`] traits, so tests
//! can drive it without real processes.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{SessionError, SessionId};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How often the waiter polls the child for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long an exited child's remaining output may take to arrive.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Everything needed to start one shell process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Session the process belongs to (used for logging and thread names).
    pub session_id: SessionId,
    /// Shell executable.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory; inherits the daemon's when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

/// How a shell process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, when the process exited on its own.
    pub code: Option<i32>,
    /// Signal description, when the process was terminated by a signal.
    pub signal: Option<String>,
}

impl From<&portable_pty::ExitStatus> for ExitStatus {
    fn from(status: &portable_pty::ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => ExitStatus {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => ExitStatus {
                code: i32::try_from(status.exit_code()).ok(),
                signal: None,
            },
        }
    }
}

/// Asynchronous notifications from a running process.
///
/// `Exit` is delivered exactly once and nothing follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output, decoded as UTF-8.
    Data(String),
    /// The process ended.
    Exit(ExitStatus),
}

/// Channel a spawned process reports its events on.
pub type PtyEventSender = mpsc::UnboundedSender<PtyEvent>;

/// Event channel shared by the reader and waiter threads. The waiter takes it
/// when reporting the exit, so no output can follow `Exit`.
type EventSink = Arc<Mutex<Option<PtyEventSender>>>;

/// A running shell process bound to a PTY.
///
/// None of these operations fail from the caller's point of view: writes and
/// resizes on a dead process are dropped, and kill is idempotent.
pub trait PtyProcess: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Queue bytes for the process's stdin.
    fn write(&mut self, data: &[u8]);

    /// Change the terminal size. Both dimensions are clamped to at least 1.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Terminate the process.
    fn kill(&mut self);
}

/// Starts shell processes.
pub trait PtySpawner: Send + Sync {
    /// Spawn a process for `request`, reporting its output and exit on `events`.
    fn spawn(
        &self,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError>;
}

/// [`PtySpawner`] backed by the host's native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.args(&request.args);
        if let Some(ref dir) = request.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The child holds its own handle; ours would keep the PTY open past exit.
        drop(pair.slave);

        let pid = child.process_id();
        let (reader, writer) = match open_io(pair.master.as_ref()) {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let sink: EventSink = Arc::new(Mutex::new(Some(events)));
        let exited = Arc::new(AtomicBool::new(false));
        let thread_name = format!("tether-pty-{}", short_id(&request.session_id));

        // The waiter owns the child from here on; dropping `kill_tx` kills it.
        let mut fallback_killer = child.clone_killer();
        let (kill_tx, kill_rx) = std_mpsc::channel::<()>();
        let (reader_done_tx, reader_done_rx) = std_mpsc::channel::<()>();
        let waiter_thread = {
            let session_id = request.session_id.clone();
            let sink = Arc::clone(&sink);
            let exited = Arc::clone(&exited);
            thread::Builder::new()
                .name(format!("{thread_name}-wait"))
                .spawn(move || {
                    wait_for_exit(session_id, child, kill_rx, reader_done_rx, sink, exited)
                })
        };
        if let Err(e) = waiter_thread {
            let _ = fallback_killer.kill();
            return Err(SessionError::SpawnFailed(format!(
                "failed to start PTY waiter: {e}"
            )));
        }

        let output_thread = {
            let session_id = request.session_id.clone();
            let sink = Arc::clone(&sink);
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || pump_output(session_id, reader, sink, reader_done_tx))
        };
        if let Err(e) = output_thread {
            drop(kill_tx);
            return Err(SessionError::SpawnFailed(format!(
                "failed to start PTY reader: {e}"
            )));
        }

        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();
        let input_thread = {
            let session_id = request.session_id.clone();
            thread::Builder::new()
                .name(format!("{thread_name}-in"))
                .spawn(move || pump_input(session_id, writer, input_rx))
        };
        if let Err(e) = input_thread {
            drop(kill_tx);
            return Err(SessionError::SpawnFailed(format!(
                "failed to start PTY writer: {e}"
            )));
        }

        info!(
            session_id = %request.session_id,
            shell = %request.shell,
            pid = ?pid,
            cols = request.cols,
            rows = request.rows,
            "Spawned shell"
        );

        Ok(Box::new(NativePty {
            session_id: request.session_id.clone(),
            pid,
            master: pair.master,
            input_tx,
            kill_tx: Some(kill_tx),
            exited,
        }))
    }
}

/// A shell running on a native PTY.
///
/// Output is read on a dedicated thread and the child is reaped on another,
/// so an exit is seen even while a background job keeps the PTY open. Input
/// is handed to a writer thread so a process that stops reading stdin never
/// blocks the caller.
pub struct NativePty {
    session_id: SessionId,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    input_tx: std_mpsc::Sender<Vec<u8>>,
    /// Taken on the first kill.
    kill_tx: Option<std_mpsc::Sender<()>>,
    exited: Arc<AtomicBool>,
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.exited.load(Ordering::SeqCst) {
            return;
        }
        if self.input_tx.send(data.to_vec()).is_err() {
            debug!(session_id = %self.session_id, "PTY writer gone, dropping input");
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let size = pty_size(cols, rows);
        match self.master.resize(size) {
            Ok(()) => debug!(
                session_id = %self.session_id,
                cols = size.cols,
                rows = size.rows,
                "Resized PTY"
            ),
            Err(e) => debug!(
                session_id = %self.session_id,
                error = %e,
                "Failed to resize PTY"
            ),
        }
    }

    fn kill(&mut self) {
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        if kill_tx.send(()).is_err() {
            debug!(session_id = %self.session_id, "PTY waiter gone, nothing to kill");
        }
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Builds a PTY size, clamping both dimensions to at least 1.
fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

type PtyIo = (Box<dyn Read + Send>, Box<dyn Write + Send>);

fn open_io(master: &dyn MasterPty) -> anyhow::Result<PtyIo> {
    let reader = master.try_clone_reader()?;
    let writer = master.take_writer()?;
    Ok((reader, writer))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Reader thread body: forwards output until EOF or until the exit has been reported.
fn pump_output(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    sink: EventSink,
    _done: std_mpsc::Sender<()>,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() && !emit(&sink, PtyEvent::Data(text)) {
                    trace!(session_id = %session_id, "Exit already reported, dropping output");
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is closed.
                debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    if let Some(rest) = decoder.finish() {
        emit(&sink, PtyEvent::Data(rest));
    }
}

/// Waiter thread body: reaps the child, killing it on request, then reports
/// the exit once the reader has drained or the drain timeout passed.
fn wait_for_exit(
    session_id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    kill_requests: std_mpsc::Receiver<()>,
    reader_done: std_mpsc::Receiver<()>,
    sink: EventSink,
    exited: Arc<AtomicBool>,
) {
    let mut kill_requests = Some(kill_requests);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break ExitStatus::from(&status),
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to reap shell");
                break ExitStatus::default();
            }
        }

        let kill = match &kill_requests {
            Some(requests) => match requests.recv_timeout(EXIT_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
            None => {
                thread::sleep(EXIT_POLL_INTERVAL);
                false
            }
        };
        if kill {
            kill_requests = None;
            // SIGHUP, then SIGKILL if the process outlives the grace period.
            if let Err(e) = child.kill() {
                debug!(session_id = %session_id, error = %e, "Failed to kill shell");
            }
        }
    };
    exited.store(true, Ordering::SeqCst);

    // EOF is late or never when a background job still holds the PTY.
    let _ = reader_done.recv_timeout(OUTPUT_DRAIN_TIMEOUT);

    let events = sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    info!(
        session_id = %session_id,
        exit_code = ?status.code,
        signal = ?status.signal,
        "Shell exited"
    );
    if let Some(events) = events {
        let _ = events.send(PtyEvent::Exit(status));
    }
}

/// Sends an event unless the exit has already been reported.
///
/// Returns false once the sink is closed. A dropped receiver does not count:
/// the PTY keeps being drained so the child never blocks on output.
fn emit(sink: &EventSink, event: PtyEvent) -> bool {
    let guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(events) => {
            let _ = events.send(event);
            true
        }
        None => false,
    }
}

/// Writer thread body: copies queued input into the PTY until the queue closes.
fn pump_input(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    input: std_mpsc::Receiver<Vec<u8>>,
) {
    for data in input {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!(session_id = %session_id, error = %e, "PTY write failed");
            break;
        }
    }
}

/// Incremental UTF-8 decoder.
///
/// Carries an incomplete trailing sequence over to the next chunk and replaces
/// invalid sequences with U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let carry = rest.to_vec();
        self.pending = carry;
        out
    }

    /// Flushes a dangling partial sequence at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_request() -> SpawnRequest {
        SpawnRequest {
            session_id: "pty-test-session".to_string(),
            shell: "/bin/sh".to_string(),
            args: vec![],
            cwd: None,
            env: vec![],
            cols: 80,
            rows: 24,
        }
    }

    /// Collects output until `needle` shows up or the deadline passes.
    async fn wait_for_output(
        rx: &mut mpsc::UnboundedReceiver<PtyEvent>,
        needle: &str,
    ) -> (bool, Option<ExitStatus>) {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(PtyEvent::Data(text))) => {
                    seen.push_str(&text);
                    if seen.contains(needle) {
                        return (true, None);
                    }
                }
                Ok(Some(PtyEvent::Exit(status))) => return (seen.contains(needle), Some(status)),
                Ok(None) => return (false, None),
                Err(_) => {}
            }
        }
        (false, None)
    }

    async fn recv_exit(rx: &mut mpsc::UnboundedReceiver<PtyEvent>) -> Option<ExitStatus> {
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(PtyEvent::Exit(status))) => return Some(status),
                Ok(Some(PtyEvent::Data(_))) => {}
                Ok(None) => return None,
                Err(_) => {}
            }
        }
        None
    }

    #[test]
    fn test_decoder_passes_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_carries_split_sequence() {
        let bytes = "é✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..3]), "é");
        assert_eq!(decoder.decode(&bytes[3..]), "✓");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_flushes_dangling_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"ok\xe2\x9c"), "ok");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn test_pty_size_clamps_to_one() {
        let size = pty_size(0, 0);
        assert_eq!((size.cols, size.rows), (1, 1));
        let size = pty_size(120, 40);
        assert_eq!((size.cols, size.rows), (120, 40));
    }

    #[test]
    fn test_exit_status_conversion() {
        let status = ExitStatus::from(&portable_pty::ExitStatus::with_exit_code(3));
        assert_eq!(status.code, Some(3));
        assert_eq!(status.signal, None);

        let status = ExitStatus::from(&portable_pty::ExitStatus::with_signal("Hangup"));
        assert_eq!(status.code, None);
        assert_eq!(status.signal.as_deref(), Some("Hangup"));
    }

    #[tokio::test]
    async fn test_spawn_echo_roundtrip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner
            .spawn(&sh_request(), tx)
            .expect("spawn /bin/sh");
        assert!(process.pid().is_some());

        process.write(b"echo pty_marker_$((40+2))\n");
        let (found, _) = wait_for_output(&mut rx, "pty_marker_42").await;
        assert!(found, "Did not receive expected output");

        process.kill();
    }

    #[tokio::test]
    async fn test_env_and_term_are_set() {
        let mut request = sh_request();
        request.env = vec![("TETHER_TEST_VAR".to_string(), "tv_value".to_string())];

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&request, tx).expect("spawn");

        process.write(b"echo \"$TETHER_TEST_VAR:$TERM\"\n");
        let (found, _) = wait_for_output(&mut rx, "tv_value:xterm-256color").await;
        assert!(found, "Did not receive expected environment");

        process.kill();
    }

    #[tokio::test]
    async fn test_exit_code_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");

        process.write(b"exit 7\n");
        let status = recv_exit(&mut rx).await.expect("exit event");
        assert_eq!(status.code, Some(7));

        // Nothing follows Exit; the waiter drops the only sender.
        let next = timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(next, Ok(None)));

        // Operations on an exited process are harmless.
        process.write(b"echo ignored\n");
        process.resize(100, 30);
        process.kill();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");

        process.kill();
        process.kill();

        let status = recv_exit(&mut rx).await.expect("exit event after kill");
        assert!(status.code.is_some() || status.signal.is_some());
        process.kill();
    }

    #[tokio::test]
    async fn test_kill_escalates_when_hangup_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");
        let pid = process.pid().expect("pid");

        process.write(b"trap '' HUP; echo ready_$((40+1))\n");
        let (found, _) = wait_for_output(&mut rx, "ready_41").await;
        assert!(found, "Shell never installed the trap");

        process.kill();
        let status = recv_exit(&mut rx).await.expect("exit event after kill");
        assert_ne!(status.code, Some(0));
        if cfg!(target_os = "linux") {
            assert!(
                !std::path::Path::new(&format!("/proc/{pid}")).exists(),
                "shell {pid} survived kill"
            );
        }
    }

    #[tokio::test]
    async fn test_exit_reported_while_background_job_holds_pty() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");

        process.write(b"sleep 5 &\nexit 5\n");
        let status = recv_exit(&mut rx).await.expect("exit event");
        assert_eq!(status.code, Some(5));

        // The background job still holds the PTY, but nothing follows Exit.
        let next = timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");
        drop(process);

        assert!(recv_exit(&mut rx).await.is_some());
    }

    #[tokio::test]
    async fn test_resize_zero_is_clamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = NativePtySpawner.spawn(&sh_request(), tx).expect("spawn");

        process.resize(0, 0);
        process.write(b"stty size\n");
        let (found, _) = wait_for_output(&mut rx, "1 1").await;
        assert!(found, "stty did not report the clamped size");

        process.kill();
    }

    #[tokio::test]
    async fn test_spawn_missing_shell_fails() {
        let mut request = sh_request();
        request.shell = "/nonexistent/shell-binary".to_string();

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = NativePtySpawner.spawn(&request, tx);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }
}
