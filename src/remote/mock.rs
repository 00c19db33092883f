//! Scripted in-memory transport
//!
//! Commands are answered by the first registered prefix that matches;
//! anything else exits with 127. Uploaded files are kept in memory so tests
//! can inspect what would have landed on the remote host.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    CommandOutput, FileChannel, RemoteSession, RemoteTransport, SessionConnector, SessionParams,
    OS_PROBE_COMMAND,
};
use crate::error::{BeamlineError, Result};

#[derive(Default)]
struct MockState {
    responses: Vec<(String, CommandOutput)>,
    executed: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    modes: HashMap<String, u32>,
    removed: Vec<String>,
    open_channels: usize,
    opened_channels: usize,
    reject_auth: bool,
    connects: usize,
    closed: bool,
}

/// Shared handle; clones observe the same remote host.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host answering `uname` with `Linux` and a `/tmp` temp dir.
    pub fn linux() -> Self {
        let mock = Self::new();
        mock.respond(OS_PROBE_COMMAND, 0, "Linux\n", "");
        mock.respond("echo \"${TMPDIR:-/tmp}\"", 0, "/tmp\n", "");
        mock
    }

    /// Host without `uname`.
    pub fn windows() -> Self {
        let mock = Self::new();
        mock.respond(
            OS_PROBE_COMMAND,
            1,
            "",
            "'uname' is not recognized as an internal or external command",
        );
        mock.respond(
            "echo %TEMP%",
            0,
            "C:\\Users\\beam\\AppData\\Local\\Temp\r\n",
            "",
        );
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test poisons the lock; later assertions still want the data
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer commands starting with `prefix`. Later registrations win.
    pub fn respond(&self, prefix: &str, status: i32, stdout: &str, stderr: &str) -> &Self {
        self.lock().responses.insert(
            0,
            (
                prefix.to_string(),
                CommandOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            ),
        );
        self
    }

    /// Make every `connect` fail authentication.
    pub fn reject_auth(&self) -> &Self {
        self.lock().reject_auth = true;
        self
    }

    /// Put a file on the fake remote host.
    pub fn seed_file(&self, path: &str, content: &[u8]) {
        self.lock().files.insert(path.to_string(), content.to_vec());
    }

    /// Session over this transport, bypassing authentication.
    pub fn session(&self, host: &str) -> RemoteSession {
        RemoteSession::new(host, Box::new(self.clone()))
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn mode_of(&self, path: &str) -> Option<u32> {
        self.lock().modes.get(path).copied()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// File channels opened and not yet closed.
    pub fn open_channels(&self) -> usize {
        self.lock().open_channels
    }

    pub fn opened_channels(&self) -> usize {
        self.lock().opened_channels
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.executed.push(command.to_string());
        let output = state
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput {
                status: 127,
                stdout: String::new(),
                stderr: format!("{}: command not found", command),
            });
        Ok(output)
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        let mut state = self.lock();
        state.open_channels += 1;
        state.opened_channels += 1;
        Ok(Box::new(MockFileChannel {
            mock: self.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[async_trait]
impl SessionConnector for MockTransport {
    async fn connect(&self, params: &SessionParams) -> Result<RemoteSession> {
        let reject = {
            let mut state = self.lock();
            state.connects += 1;
            state.reject_auth
        };
        if reject {
            return Err(BeamlineError::Authentication {
                host: params.host.clone(),
                user: params.user.clone(),
                reason: format!("{} rejected", params.auth.method_name()),
            });
        }
        Ok(self.session(&params.host))
    }
}

struct MockFileChannel {
    mock: MockTransport,
}

#[async_trait]
impl FileChannel for MockFileChannel {
    async fn put(&mut self, local: &Path, remote: &str) -> Result<()> {
        let content = tokio::fs::read(local).await?;
        self.mock.lock().files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<()> {
        let mut state = self.mock.lock();
        if !state.files.contains_key(remote) {
            return Err(BeamlineError::RemoteFileMissing(remote.to_string()));
        }
        state.modes.insert(remote.to_string(), mode);
        Ok(())
    }

    async fn remove(&mut self, remote: &str) -> Result<()> {
        let mut state = self.mock.lock();
        if state.files.remove(remote).is_none() {
            return Err(BeamlineError::RemoteFileMissing(remote.to_string()));
        }
        state.removed.push(remote.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.mock.lock();
        state.open_channels = state.open_channels.saturating_sub(1);
        Ok(())
    }
}
