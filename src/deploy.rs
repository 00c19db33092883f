//! Agent deployment onto remote hosts
//!
//! Artifacts are laid out as `<assets>/<version>/<os>/beamline-agent[.exe]`.
//! A deployed agent lives under a randomized name in the remote temp
//! directory until `teardown` removes it.

use std::path::{Path, PathBuf};

use beamline_proto::ProtocolVersion;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{BeamlineError, Result};
use crate::remote::{OsFamily, RemoteSession};

pub const AGENT_BINARY: &str = "beamline-agent";
const SUFFIX_LEN: usize = 10;
/// Expected in the agent's output when run without arguments.
const USAGE_BANNER: &str = "usage";

/// Pre-built agent binaries, one per protocol version and OS family.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    assets: PathBuf,
}

impl AgentCatalog {
    pub fn new(assets: impl Into<PathBuf>) -> Self {
        Self {
            assets: assets.into(),
        }
    }

    pub fn artifact_path(&self, version: ProtocolVersion, os: OsFamily) -> PathBuf {
        let file = if os.is_windows() {
            format!("{}.exe", AGENT_BINARY)
        } else {
            AGENT_BINARY.to_string()
        };
        self.assets
            .join(version.to_string())
            .join(os.as_str())
            .join(file)
    }

    /// Locate the artifact, failing if it was never built.
    pub fn artifact(&self, version: ProtocolVersion, os: OsFamily) -> Result<PathBuf> {
        let path = self.artifact_path(version, os);
        if path.is_file() {
            Ok(path)
        } else {
            Err(BeamlineError::Deployment(format!(
                "No {} agent for {} at {}",
                version,
                os,
                path.display()
            )))
        }
    }
}

/// Source of the random part of remote agent names.
pub trait NameGenerator: Send + Sync {
    fn suffix(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNames;

impl NameGenerator for RandomNames {
    fn suffix(&self) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect()
    }
}

/// Always hands out the same suffix.
#[derive(Debug, Clone)]
pub struct FixedName(pub String);

impl NameGenerator for FixedName {
    fn suffix(&self) -> String {
        self.0.clone()
    }
}

/// Remote location of an agent named after `suffix`.
/// Quote one argument for the remote shell.
///
/// POSIX shells get single quotes with embedded quotes spelled `'\''`;
/// Windows gets double quotes with embedded quotes backslash-escaped.
pub fn quote_argument(value: &str, os: OsFamily) -> String {
    if os.is_windows() {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

pub fn remote_agent_path(temp_dir: &str, os: OsFamily, suffix: &str) -> String {
    if os.is_windows() {
        format!("{}\\agent_{}.exe", temp_dir.trim_end_matches('\\'), suffix)
    } else {
        format!("{}/agent_{}", temp_dir.trim_end_matches('/'), suffix)
    }
}

/// Permission bits for the uploaded agent: the local bits plus execute.
pub fn executable_mode(local: &Path) -> Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(local)?.permissions().mode() & 0o7777;
        Ok(mode | 0o111)
    }
    #[cfg(not(unix))]
    {
        std::fs::metadata(local)?;
        Ok(0o755)
    }
}

pub struct AgentDeployer {
    catalog: AgentCatalog,
    names: Box<dyn NameGenerator>,
}

impl AgentDeployer {
    pub fn new(catalog: AgentCatalog) -> Self {
        Self::with_names(catalog, Box::new(RandomNames))
    }

    pub fn with_names(catalog: AgentCatalog, names: Box<dyn NameGenerator>) -> Self {
        Self { catalog, names }
    }

    /// Upload the matching agent and return a handle to run it.
    pub async fn deploy<'s>(
        &self,
        session: &'s RemoteSession,
        version: ProtocolVersion,
    ) -> Result<DeployedAgent<'s>> {
        let os = session.probe_os().await;
        let local = self.catalog.artifact(version, os)?;
        let temp_dir = session.resolve_temp_dir().await?;
        let remote_path = remote_agent_path(&temp_dir, os, &self.names.suffix());

        let agent = DeployedAgent {
            session,
            remote_path,
            version,
            os,
        };

        let mut channel = session.open_file_channel().await?;
        let uploaded = agent.upload(channel.as_mut(), &local).await;
        let closed = channel.close().await;

        if let Err(e) = uploaded.and(closed) {
            agent.teardown().await;
            return Err(match e {
                BeamlineError::Deployment(_) | BeamlineError::Authentication { .. } => e,
                other => BeamlineError::Deployment(format!(
                    "Upload to {} failed: {}",
                    session.host(),
                    other
                )),
            });
        }

        info!(
            host = session.host(),
            "Deployed {} agent to {}", version, agent.remote_path
        );
        Ok(agent)
    }
}

/// An agent present on the remote host.
pub struct DeployedAgent<'s> {
    session: &'s RemoteSession,
    remote_path: String,
    version: ProtocolVersion,
    os: OsFamily,
}

impl DeployedAgent<'_> {
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn upload(&self, channel: &mut dyn crate::remote::FileChannel, local: &Path) -> Result<()> {
        channel.put(local, &self.remote_path).await?;
        if !self.os.is_windows() {
            channel
                .chmod(&self.remote_path, executable_mode(local)?)
                .await?;
        }
        Ok(())
    }

    /// Command line starting a transfer of `directory` to `receiver_host`.
    pub fn command_line(&self, beam_id: i64, directory: &str, receiver_host: &str) -> String {
        let directory = quote_argument(directory, self.os);
        let receiver_host = quote_argument(receiver_host, self.os);
        match self.version {
            ProtocolVersion::V1 => format!(
                "{} {} {} {}",
                self.remote_path, beam_id, directory, receiver_host
            ),
            ProtocolVersion::V2 => format!(
                "{} -b {} -p {} -t {}",
                self.remote_path, beam_id, directory, receiver_host
            ),
        }
    }

    /// Start the agent; it detaches and streams in the background.
    pub async fn run(&self, beam_id: i64, directory: &str, receiver_host: &str) -> Result<String> {
        let command = self.command_line(beam_id, directory, receiver_host);
        let output = self.session.run(&command, true).await?;
        Ok(output.unwrap_or_default())
    }

    /// Liveness probe: the bare binary must print its usage banner.
    pub async fn ping(&self) -> Result<bool> {
        let output = self.session.exec_raw(&self.remote_path).await?;
        let combined = format!("{}{}", output.stdout, output.stderr).to_lowercase();
        Ok(combined.contains(USAGE_BANNER))
    }

    /// Remove the uploaded artifact. Failures are logged, never raised.
    pub async fn teardown(self) {
        let mut channel = match self.session.open_file_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    host = self.session.host(),
                    "Cannot open channel to remove {}: {}", self.remote_path, e
                );
                return;
            }
        };

        match channel.remove(&self.remote_path).await {
            Ok(()) => debug!(host = self.session.host(), "Removed {}", self.remote_path),
            Err(BeamlineError::RemoteFileMissing(path)) => {
                warn!(host = self.session.host(), "Agent {} already gone", path)
            }
            Err(e) => warn!(
                host = self.session.host(),
                "Failed to remove {}: {}", self.remote_path, e
            ),
        }

        if let Err(e) = channel.close().await {
            warn!(host = self.session.host(), "Closing file channel failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockTransport;
    use tempfile::TempDir;

    fn catalog_with(dir: &Path, version: ProtocolVersion, os: OsFamily) -> AgentCatalog {
        let catalog = AgentCatalog::new(dir);
        let path = catalog.artifact_path(version, os);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\x7fELF agent").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
        }
        catalog
    }

    fn deployer(catalog: AgentCatalog) -> AgentDeployer {
        AgentDeployer::with_names(catalog, Box::new(FixedName("abcdefghij".into())))
    }

    #[test]
    fn test_random_suffix_shape() {
        let a = RandomNames.suffix();
        let b = RandomNames.suffix();
        assert_eq!(a.len(), SUFFIX_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_remote_paths_follow_os_syntax() {
        assert_eq!(
            remote_agent_path("/tmp/", OsFamily::Linux, "x1"),
            "/tmp/agent_x1"
        );
        assert_eq!(
            remote_agent_path("C:\\Temp", OsFamily::Windows, "x1"),
            "C:\\Temp\\agent_x1.exe"
        );
    }

    #[test]
    fn test_missing_artifact_is_deployment_error() {
        let dir = TempDir::new().unwrap();
        let catalog = AgentCatalog::new(dir.path());
        assert!(matches!(
            catalog.artifact(ProtocolVersion::V2, OsFamily::FreeBsd),
            Err(BeamlineError::Deployment(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_uploads_and_sets_executable_bits() {
        let dir = TempDir::new().unwrap();
        let remote = MockTransport::linux();
        let session = remote.session("host");
        let deployer = deployer(catalog_with(dir.path(), ProtocolVersion::V2, OsFamily::Linux));

        let agent = deployer.deploy(&session, ProtocolVersion::V2).await.unwrap();

        assert_eq!(agent.remote_path(), "/tmp/agent_abcdefghij");
        assert_eq!(
            remote.file("/tmp/agent_abcdefghij").unwrap(),
            b"\x7fELF agent".to_vec()
        );
        #[cfg(unix)]
        assert_eq!(remote.mode_of("/tmp/agent_abcdefghij"), Some(0o751));
        assert_eq!(remote.open_channels(), 0);

        agent.teardown().await;
        assert_eq!(remote.removed(), vec!["/tmp/agent_abcdefghij"]);
        assert_eq!(remote.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_windows_deploy_skips_chmod() {
        let dir = TempDir::new().unwrap();
        let remote = MockTransport::windows();
        let session = remote.session("winhost");
        let deployer = deployer(catalog_with(
            dir.path(),
            ProtocolVersion::V1,
            OsFamily::Windows,
        ));

        let agent = deployer.deploy(&session, ProtocolVersion::V1).await.unwrap();
        let path = "C:\\Users\\beam\\AppData\\Local\\Temp\\agent_abcdefghij.exe";
        assert_eq!(agent.remote_path(), path);
        assert!(remote.file(path).is_some());
        assert_eq!(remote.mode_of(path), None);
    }

    #[tokio::test]
    async fn test_command_lines_per_version() {
        let dir = TempDir::new().unwrap();
        let remote = MockTransport::linux();
        let session = remote.session("host");

        let v1 = deployer(catalog_with(dir.path(), ProtocolVersion::V1, OsFamily::Linux))
            .deploy(&session, ProtocolVersion::V1)
            .await
            .unwrap();
        assert_eq!(
            v1.command_line(42, "/var/log", "scotty"),
            "/tmp/agent_abcdefghij 42 '/var/log' 'scotty'"
        );

        let v2 = deployer(catalog_with(dir.path(), ProtocolVersion::V2, OsFamily::Linux))
            .deploy(&session, ProtocolVersion::V2)
            .await
            .unwrap();
        assert_eq!(
            v2.command_line(42, "/var/log", "scotty"),
            "/tmp/agent_abcdefghij -b 42 -p '/var/log' -t 'scotty'"
        );
    }

    #[test]
    fn test_arguments_are_quoted_for_the_remote_shell() {
        assert_eq!(
            quote_argument("/srv/it's $(reboot) `id`", OsFamily::Linux),
            "'/srv/it'\\''s $(reboot) `id`'"
        );
        assert_eq!(
            quote_argument("C:\\Logs\\say \"hi\"", OsFamily::Windows),
            "\"C:\\Logs\\say \\\"hi\\\"\""
        );
    }

    #[tokio::test]
    async fn test_ping_looks_for_usage_banner() {
        let dir = TempDir::new().unwrap();
        let remote = MockTransport::linux();
        let session = remote.session("host");
        let agent = deployer(catalog_with(dir.path(), ProtocolVersion::V2, OsFamily::Linux))
            .deploy(&session, ProtocolVersion::V2)
            .await
            .unwrap();

        remote.respond(
            "/tmp/agent_abcdefghij",
            2,
            "",
            "error: missing arguments\n\nUsage: beamline-agent [OPTIONS]",
        );
        assert!(agent.ping().await.unwrap());

        remote.respond("/tmp/agent_abcdefghij", 126, "", "Permission denied");
        assert!(!agent.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let remote = MockTransport::linux();
        let session = remote.session("host");
        let agent = deployer(catalog_with(dir.path(), ProtocolVersion::V2, OsFamily::Linux))
            .deploy(&session, ProtocolVersion::V2)
            .await
            .unwrap();

        // the agent deletes itself once it finishes
        let mut channel = session.open_file_channel().await.unwrap();
        channel.remove("/tmp/agent_abcdefghij").await.unwrap();
        channel.close().await.unwrap();

        agent.teardown().await;
        assert_eq!(remote.open_channels(), 0);
        assert!(remote.file_names().is_empty());
    }
}
