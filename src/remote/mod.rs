//! Remote sessions: command execution and file copy on a remote host
//!
//! `RemoteSession` holds the host-level logic (OS probing, temp directory
//! discovery, exit status policy) on top of a `RemoteTransport`, which only
//! knows how to run a command and open a file channel. `ssh` provides the
//! real transport; `mock` a scripted one for tests.

pub mod mock;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{BeamlineError, Result};

pub use ssh::SshConnector;

/// Command used to tell POSIX systems apart from Windows.
pub const OS_PROBE_COMMAND: &str = "uname";
const POSIX_TEMP_PROBE: &str = "echo \"${TMPDIR:-/tmp}\"";
const WINDOWS_TEMP_PROBE: &str = "echo %TEMP%";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Linux,
    Darwin,
    FreeBsd,
    Windows,
}

impl OsFamily {
    /// Interpret the probe's output; anything unrecognized is Windows.
    pub fn from_probe(output: Option<&str>) -> Self {
        match output.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("linux") => OsFamily::Linux,
            Some("darwin") => OsFamily::Darwin,
            Some("freebsd") => OsFamily::FreeBsd,
            _ => OsFamily::Windows,
        }
    }

    pub fn is_windows(self) -> bool {
        self == OsFamily::Windows
    }

    /// Directory name used in the agent artifact catalog.
    pub fn as_str(self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Darwin => "darwin",
            OsFamily::FreeBsd => "freebsd",
            OsFamily::Windows => "windows",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit status and both output streams of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// How to authenticate against the remote host.
#[derive(Debug, Clone)]
pub enum RemoteAuth {
    /// Private key material supplied with the request
    InlineKey(SecretString),
    /// Private key file kept on this server
    StoredKey(PathBuf),
    Password(SecretString),
}

impl RemoteAuth {
    pub fn method_name(&self) -> &'static str {
        match self {
            RemoteAuth::InlineKey(_) => "inline_key",
            RemoteAuth::StoredKey(_) => "stored_key",
            RemoteAuth::Password(_) => "password",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: RemoteAuth,
}

impl SessionParams {
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: RemoteAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            auth,
        }
    }
}

/// Raw command and file-copy access to one remote host.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Secondary file-copy channel.
///
/// Must be released with [`FileChannel::close`] on every exit path.
#[async_trait]
pub trait FileChannel: Send {
    async fn put(&mut self, local: &Path, remote: &str) -> Result<()>;

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<()>;

    /// Fails with `RemoteFileMissing` when `remote` does not exist.
    async fn remove(&mut self, remote: &str) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens authenticated sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, params: &SessionParams) -> Result<RemoteSession>;
}

pub struct RemoteSession {
    host: String,
    transport: Box<dyn RemoteTransport>,
    os: OnceCell<OsFamily>,
}

impl RemoteSession {
    pub fn new(host: impl Into<String>, transport: Box<dyn RemoteTransport>) -> Self {
        Self {
            host: host.into(),
            transport,
            os: OnceCell::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Detect the OS family once per session.
    pub async fn probe_os(&self) -> OsFamily {
        *self
            .os
            .get_or_init(|| async {
                let output = match self.transport.exec(OS_PROBE_COMMAND).await {
                    Ok(out) if out.success() => Some(out.stdout),
                    Ok(out) => {
                        debug!(host = %self.host, status = out.status, "OS probe failed");
                        None
                    }
                    Err(e) => {
                        debug!(host = %self.host, "OS probe errored: {}", e);
                        None
                    }
                };
                let family = OsFamily::from_probe(output.as_deref());
                info!(host = %self.host, "Detected {} host", family);
                family
            })
            .await
    }

    /// Writable scratch directory for the detected OS family.
    pub async fn resolve_temp_dir(&self) -> Result<String> {
        let probe = if self.probe_os().await.is_windows() {
            WINDOWS_TEMP_PROBE
        } else {
            POSIX_TEMP_PROBE
        };
        let dir = self.run(probe, true).await?.unwrap_or_default();
        if dir.is_empty() {
            return Err(BeamlineError::Deployment(format!(
                "{} reported no temporary directory",
                self.host
            )));
        }
        Ok(dir)
    }

    /// Run a command.
    ///
    /// With `require_success` a non-zero exit is an error carrying both
    /// streams; without it a failed command yields `None`.
    pub async fn run(&self, command: &str, require_success: bool) -> Result<Option<String>> {
        debug!(host = %self.host, "Executing {}", command);
        let output = self.transport.exec(command).await?;
        if output.success() {
            return Ok(Some(output.stdout.trim().to_string()));
        }
        if require_success {
            return Err(BeamlineError::RemoteCommand {
                command: command.to_string(),
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(None)
    }

    /// Run a command and hand back its raw output whatever the exit status.
    pub async fn exec_raw(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, "Executing {}", command);
        self.transport.exec(command).await
    }

    pub async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        self.transport.open_file_channel().await
    }

    pub async fn close(self) -> Result<()> {
        self.transport.close().await
    }
}
