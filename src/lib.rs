/*!
 * Beamline - pulls file collections ("beams") off remote hosts
 *
 * - Deploys a short-lived agent over SSH and starts it on the remote host
 * - Receives the agent's file stream and stores it sharded on local disk
 * - Tracks each beam's lifecycle and decides when it may be purged
 * - Audits recorded metadata against what is actually stored
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod audit;
pub mod config;
pub mod deploy;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod receiver;
pub mod remote;
pub mod retention;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod trackers;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{BeamlineError, Result};
pub use models::{Beam, BeamFile, BeamState, FileStatus};
pub use receiver::Receiver;
pub use retention::RetentionEngine;
pub use storage::FileStorage;
pub use store::{BeamStore, SqliteStore};
pub use tasks::{BeamRequest, Job, TaskContext, TaskQueue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
