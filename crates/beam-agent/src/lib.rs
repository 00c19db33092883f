//! Beamline agent
//!
//! A short-lived binary deployed onto a remote host. It connects back to the
//! beamline receiver, walks a directory tree and streams every regular file
//! through the beam protocol, compressing whatever is not already compressed.

pub mod cli;
pub mod client;
pub mod compress;
pub mod error;
pub mod retry;

#[cfg(unix)]
pub mod detach;
#[cfg(unix)]
pub mod syslog;

pub use cli::{Cli, Invocation};
pub use client::{beam_up, receiver_address, BeamSummary, BeamTarget};
pub use error::{AgentError, Result};
pub use retry::RetryPolicy;
