//! TCP front end: accepts pipeline connections and runs one [`Session`] per
//! client on the tokio runtime.

pub mod session;

pub use session::{Session, SessionState};

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::data::DataManager;
use crate::error::AppResult;

pub struct DataServer {
    data: Arc<DataManager>,
    wait_timeout: Duration,
}

impl DataServer {
    pub fn new(data: Arc<DataManager>, settings: &ServerSettings) -> Self {
        Self {
            data,
            wait_timeout: Duration::from_millis(settings.stream_wait_timeout_ms),
        }
    }

    pub fn with_wait_timeout(data: Arc<DataManager>, wait_timeout: Duration) -> Self {
        Self { data, wait_timeout }
    }

    pub fn data(&self) -> &Arc<DataManager> {
        &self.data
    }

    /// Accept connections until `shutdown` becomes true, then wait for the
    /// open sessions to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        let local = listener.local_addr()?;
        info!(address = %local, "Data server listening");

        let mut sessions = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        let session = Session::new(
                            stream,
                            peer.to_string(),
                            Arc::clone(&self.data),
                            self.wait_timeout,
                        );
                        sessions.spawn(session.run(shutdown.clone()));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "session task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(open = sessions.len(), "draining sessions");
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "session task panicked");
            }
        }
        info!("Data server stopped");
        Ok(())
    }
}
