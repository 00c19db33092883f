//! SSH transport
//!
//! libssh2 is blocking, so every call runs on the blocking pool with the
//! session behind a mutex. Host keys are accepted without verification.

use std::io::{self, Read};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use ssh2::{ErrorCode, FileStat, MethodType, Session, Sftp};
use tracing::{debug, warn};

use super::{
    CommandOutput, FileChannel, RemoteAuth, RemoteSession, RemoteTransport, SessionConnector,
    SessionParams,
};
use crate::error::{BeamlineError, Result};

/// Host key algorithms offered to servers that choke on rsa-sha2 negotiation.
const LEGACY_HOST_KEY_PREFS: &str =
    "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,ecdsa-sha2-nistp521,ssh-rsa,ssh-dss";

/// Public key signatures for the same servers: plain ssh-rsa, no rsa-sha2.
const LEGACY_SIGN_PREFS: &str =
    "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,ecdsa-sha2-nistp521,ssh-rsa";

/// Pause between polls while a command produces no output
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Method preferences applied on the legacy retry. Both the host key and
/// the user key signature must avoid rsa-sha2 or old servers reject us.
fn legacy_method_prefs() -> [(MethodType, &'static str); 2] {
    [
        (MethodType::HostKey, LEGACY_HOST_KEY_PREFS),
        (MethodType::SignAlgo, LEGACY_SIGN_PREFS),
    ]
}

/// sftp status code for a missing file
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Connects with ssh2.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, params: &SessionParams) -> Result<RemoteSession> {
        let params = params.clone();
        let timeout = self.timeout;
        let host = params.host.clone();
        let transport =
            tokio::task::spawn_blocking(move || SshTransport::connect_blocking(&params, timeout))
                .await
                .map_err(|e| BeamlineError::Connectivity(format!("Task join error: {}", e)))??;
        Ok(RemoteSession::new(host, Box::new(transport)))
    }
}

pub struct SshTransport {
    session: Arc<Mutex<Session>>,
}

impl SshTransport {
    fn connect_blocking(params: &SessionParams, timeout: Duration) -> Result<Self> {
        match Self::open(params, timeout, false) {
            Err(BeamlineError::Authentication { reason, .. }) => {
                warn!(
                    host = %params.host,
                    "Authentication failed ({}), retrying with legacy key negotiation",
                    reason
                );
                Self::open(params, timeout, true)
            }
            other => other,
        }
    }

    fn open(params: &SessionParams, timeout: Duration, legacy: bool) -> Result<Self> {
        let addr = format!("{}:{}", params.host, params.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| BeamlineError::Connectivity(format!("Cannot connect to {}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();

        let mut session = Session::new().map_err(|e| {
            BeamlineError::Connectivity(format!("Failed to create SSH session: {}", e))
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        if legacy {
            for (method, prefs) in legacy_method_prefs() {
                session
                    .method_pref(method, prefs)
                    .map_err(|e| BeamlineError::Connectivity(e.to_string()))?;
            }
        }

        session.handshake().map_err(|e| {
            BeamlineError::Connectivity(format!("SSH handshake with {} failed: {}", addr, e))
        })?;

        let auth_error = |e: ssh2::Error| BeamlineError::Authentication {
            host: params.host.clone(),
            user: params.user.clone(),
            reason: e.message().to_string(),
        };
        match &params.auth {
            RemoteAuth::Password(password) => session
                .userauth_password(&params.user, password.expose_secret())
                .map_err(auth_error)?,
            RemoteAuth::InlineKey(key) => session
                .userauth_pubkey_memory(&params.user, None, key.expose_secret(), None)
                .map_err(auth_error)?,
            RemoteAuth::StoredKey(path) => session
                .userauth_pubkey_file(&params.user, None, path, None)
                .map_err(auth_error)?,
        }

        if !session.authenticated() {
            return Err(BeamlineError::Authentication {
                host: params.host.clone(),
                user: params.user.clone(),
                reason: format!("{} was not accepted", params.auth.method_name()),
            });
        }

        debug!(host = %params.host, user = %params.user, "SSH session established");
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| BeamlineError::Connectivity("SSH session lock poisoned".into()))?;
            op(&guard)
        })
        .await
        .map_err(|e| BeamlineError::Connectivity(format!("Task join error: {}", e)))?
    }
}

fn connectivity(e: ssh2::Error) -> BeamlineError {
    BeamlineError::Connectivity(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Read both output streams in turns until each reports end of stream.
///
/// `read` must not block: it returns `WouldBlock` while a stream is idle.
/// Reading one stream to completion first would stall once the other fills
/// the channel window.
fn drain_output<F>(mut read: F) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    F: FnMut(Pipe, &mut [u8]) -> io::Result<usize>,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut open = [true, true];
    let mut buf = vec![0u8; 32 * 1024];

    while open.iter().any(|o| *o) {
        let mut idle = true;
        for (i, pipe) in [Pipe::Stdout, Pipe::Stderr].into_iter().enumerate() {
            if !open[i] {
                continue;
            }
            match read(pipe, &mut buf) {
                Ok(0) => {
                    open[i] = false;
                    idle = false;
                }
                Ok(n) => {
                    let sink = if pipe == Pipe::Stdout { &mut stdout } else { &mut stderr };
                    sink.extend_from_slice(&buf[..n]);
                    idle = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => idle = false,
                Err(e) => return Err(e),
            }
        }
        if idle {
            std::thread::sleep(IDLE_POLL);
        }
    }
    Ok((stdout, stderr))
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let command = command.to_string();
        self.blocking(move |session| {
            let mut channel = session.channel_session().map_err(connectivity)?;
            channel.exec(&command).map_err(connectivity)?;

            session.set_blocking(false);
            let drained = drain_output(|pipe, buf| match pipe {
                Pipe::Stdout => channel.read(buf),
                Pipe::Stderr => channel.stderr().read(buf),
            });
            session.set_blocking(true);
            let (stdout, stderr) = drained?;

            channel.wait_close().map_err(connectivity)?;
            let status = channel.exit_status().map_err(connectivity)?;
            Ok(CommandOutput {
                status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        let sftp = self
            .blocking(|session| session.sftp().map_err(connectivity))
            .await?;
        Ok(Box::new(SftpChannel {
            sftp: Arc::new(Mutex::new(sftp)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|session| {
            session
                .disconnect(None, "closing", None)
                .map_err(connectivity)
        })
        .await
    }
}

struct SftpChannel {
    sftp: Arc<Mutex<Sftp>>,
}

impl SftpChannel {
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let sftp = Arc::clone(&self.sftp);
        tokio::task::spawn_blocking(move || {
            let guard = sftp
                .lock()
                .map_err(|_| BeamlineError::Connectivity("SFTP channel lock poisoned".into()))?;
            op(&guard)
        })
        .await
        .map_err(|e| BeamlineError::Connectivity(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl FileChannel for SftpChannel {
    async fn put(&mut self, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        self.blocking(move |sftp| {
            let mut source = std::fs::File::open(&local)?;
            let mut target = sftp.create(&remote).map_err(|e| {
                BeamlineError::Deployment(format!("Cannot create {}: {}", remote.display(), e))
            })?;
            std::io::copy(&mut source, &mut target)?;
            Ok(())
        })
        .await
    }

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<()> {
        let remote = PathBuf::from(remote);
        self.blocking(move |sftp| {
            let stat = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            };
            sftp.setstat(&remote, stat).map_err(|e| {
                BeamlineError::Deployment(format!("Cannot chmod {}: {}", remote.display(), e))
            })
        })
        .await
    }

    async fn remove(&mut self, remote: &str) -> Result<()> {
        let remote = PathBuf::from(remote);
        self.blocking(move |sftp| match sftp.unlink(&remote) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Err(
                BeamlineError::RemoteFileMissing(remote.display().to_string()),
            ),
            Err(e) => Err(connectivity(e)),
        })
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // the subsystem channel shuts down when the last handle drops
        drop(self.sftp);
        Ok(())
    }
}
