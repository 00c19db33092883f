//! TCP receiver for agent connections
//!
//! Every accepted connection is served on its own task; files of one beam
//! arrive strictly one after another on that connection.

mod reporter;
mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::{BeamlineError, Result};
use crate::storage::FileStorage;

pub use reporter::{OutcomeReporter, StoreReporter};
pub use session::{handle_connection, TRANSPORTER_ERROR};

const READ_BUFFER: usize = 1024 * 1024;

pub struct Receiver {
    listener: TcpListener,
    storage: FileStorage,
    reporter: Arc<dyn OutcomeReporter>,
}

impl Receiver {
    pub async fn bind(
        addr: &str,
        storage: FileStorage,
        reporter: Arc<dyn OutcomeReporter>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BeamlineError::Connectivity(format!("Cannot bind receiver to {}: {}", addr, e))
        })?;
        Ok(Self {
            listener,
            storage,
            reporter,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Running sessions are
    /// left to finish on their own.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Listening for connections on {}", self.local_addr()?);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Receiver shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => error!("Accept failed: {}", e),
                },
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let storage = self.storage.clone();
        let reporter = Arc::clone(&self.reporter);
        debug!(%peer, "Accepted connection");
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let mut reader = BufReader::with_capacity(READ_BUFFER, read_half);
            let mut writer = BufWriter::new(write_half);
            if let Err(why) =
                handle_connection(&mut reader, &mut writer, &storage, reporter.as_ref()).await
            {
                error!(%peer, "Connection closed: {}", why);
            }
        });
    }
}
