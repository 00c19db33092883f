//! Command line handling
//!
//! Two invocation forms are accepted:
//!
//! ```text
//! beamline-agent <beam_id> <path> <receiver_host>          (protocol v1)
//! beamline-agent -b <beam_id> -p <path> -t <receiver_host> (protocol v2)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use beamline_proto::ProtocolVersion;
use clap::{CommandFactory, Parser};

use crate::retry::RetryPolicy;

/// Beamline agent - streams a directory tree to the beamline receiver.
#[derive(Parser, Debug)]
#[command(name = "beamline-agent", version, about, long_about = None)]
pub struct Cli {
    /// Beam identifier
    #[arg(short = 'b', long = "beam-id")]
    pub beam_id: Option<u64>,

    /// File or directory to beam up
    #[arg(short = 'p', long = "path")]
    pub path: Option<PathBuf>,

    /// Receiver host, optionally with a port
    #[arg(short = 't', long = "target")]
    pub target: Option<String>,

    /// Legacy positional form: <beam_id> <path> <receiver_host>
    #[arg(value_name = "ARGS", num_args = 0..=3)]
    pub positional: Vec<String>,

    /// Stay attached to the invoking session and log to stderr
    #[arg(long)]
    pub foreground: bool,

    /// Number of whole-run attempts before giving up
    #[arg(long, default_value_t = RetryPolicy::DEFAULT_ATTEMPTS, hide = true)]
    pub retry_attempts: u32,

    /// Seconds to sleep between attempts
    #[arg(long, default_value_t = RetryPolicy::DEFAULT_INTERVAL_SECS, hide = true)]
    pub retry_interval: u64,
}

/// A fully resolved agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub beam_id: u64,
    pub path: PathBuf,
    pub receiver: String,
    pub version: ProtocolVersion,
    pub foreground: bool,
    pub retry: RetryPolicy,
}

impl Invocation {
    /// Pick the protocol generation from the argument form that was used.
    pub fn resolve(cli: Cli) -> Result<Self, String> {
        let retry = RetryPolicy::new(cli.retry_attempts, Duration::from_secs(cli.retry_interval));
        let any_flag = cli.beam_id.is_some() || cli.path.is_some() || cli.target.is_some();

        if any_flag {
            if !cli.positional.is_empty() {
                return Err("positional arguments cannot be combined with -b/-p/-t".to_string());
            }
            let (Some(beam_id), Some(path), Some(receiver)) = (cli.beam_id, cli.path, cli.target)
            else {
                return Err("-b, -p and -t must all be given".to_string());
            };
            return Ok(Self {
                beam_id,
                path,
                receiver,
                version: ProtocolVersion::V2,
                foreground: cli.foreground,
                retry,
            });
        }

        match cli.positional.as_slice() {
            [beam_id, path, receiver] => {
                let beam_id = beam_id
                    .parse::<u64>()
                    .map_err(|_| format!("invalid beam id '{}'", beam_id))?;
                Ok(Self {
                    beam_id,
                    path: PathBuf::from(path),
                    receiver: receiver.clone(),
                    version: ProtocolVersion::V1,
                    foreground: cli.foreground,
                    retry,
                })
            }
            _ => Err("missing arguments".to_string()),
        }
    }
}

/// The usage banner printed when the arguments do not resolve.
pub fn usage() -> String {
    Cli::command().render_usage().to_string()
}
