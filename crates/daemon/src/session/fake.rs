//! In-memory PTY spawner for tests.
//!
//! Each spawned [`FakeProcess`] is paired with a [`FakeProcessHandle`] the test
//! keeps, which can inject output, end the process and inspect what the
//! process received.

use std::sync::{Arc, Mutex};

use super::pty::{ExitStatus, PtyEvent, PtyEventSender, PtyProcess, PtySpawner, SpawnRequest};
use super::SessionError;

#[derive(Default)]
struct SpawnerState {
    handles: Vec<FakeProcessHandle>,
    requests: Vec<SpawnRequest>,
    fail_next: bool,
}

/// Spawner that records requests and hands out scriptable processes.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next spawn fail with `SpawnFailed`.
    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Handle for the `index`th successfully spawned process.
    pub fn process(&self, index: usize) -> FakeProcessHandle {
        self.state.lock().unwrap().handles[index].clone()
    }

    /// Handle for the most recently spawned process.
    pub fn last(&self) -> FakeProcessHandle {
        let state = self.state.lock().unwrap();
        state.handles.last().cloned().expect("no process spawned")
    }

    pub fn spawned(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(SessionError::SpawnFailed("out of ptys".to_string()));
        }

        let handle = FakeProcessHandle {
            events,
            shared: Arc::new(Mutex::new(FakeShared {
                size: (request.cols, request.rows),
                ..FakeShared::default()
            })),
        };
        state.handles.push(handle.clone());
        state.requests.push(request.clone());

        Ok(Box::new(FakeProcess { handle }))
    }
}

#[derive(Default)]
struct FakeShared {
    written: Vec<u8>,
    size: (u16, u16),
    kills: usize,
    exited: bool,
}

/// Test-side view of a fake process.
#[derive(Clone)]
pub struct FakeProcessHandle {
    events: PtyEventSender,
    shared: Arc<Mutex<FakeShared>>,
}

impl FakeProcessHandle {
    /// Emits a chunk of output, unless the process has exited.
    pub fn emit(&self, text: &str) {
        if !self.shared.lock().unwrap().exited {
            let _ = self.events.send(PtyEvent::Data(text.to_string()));
        }
    }

    /// Ends the process with an exit code.
    pub fn exit(&self, code: i32) {
        self.finish(ExitStatus {
            code: Some(code),
            signal: None,
        });
    }

    fn finish(&self, status: ExitStatus) {
        let mut shared = self.shared.lock().unwrap();
        if shared.exited {
            return;
        }
        shared.exited = true;
        let _ = self.events.send(PtyEvent::Exit(status));
    }

    /// Everything written to the process so far, as text.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.shared.lock().unwrap().written).into_owned()
    }

    pub fn size(&self) -> (u16, u16) {
        self.shared.lock().unwrap().size
    }

    /// Number of kill calls that actually terminated the process.
    pub fn kills(&self) -> usize {
        self.shared.lock().unwrap().kills
    }

    pub fn exited(&self) -> bool {
        self.shared.lock().unwrap().exited
    }
}

struct FakeProcess {
    handle: FakeProcessHandle,
}

impl PtyProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write(&mut self, data: &[u8]) {
        let mut shared = self.handle.shared.lock().unwrap();
        if !shared.exited {
            shared.written.extend_from_slice(data);
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.handle.shared.lock().unwrap().size = (cols.max(1), rows.max(1));
    }

    fn kill(&mut self) {
        let alive = !self.handle.shared.lock().unwrap().exited;
        if alive {
            self.handle.shared.lock().unwrap().kills += 1;
            self.handle.finish(ExitStatus {
                code: None,
                signal: Some("Hangup".to_string()),
            });
        }
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
