//! Single broker connection and channel shared by the whole process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::topology::{self, BrokerTopology};
use super::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Result};

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns the process-wide broker connection and its one channel.
///
/// The first `channel()` call connects, opens the channel and declares the
/// topology. Concurrent first callers all await that same initialization,
/// so exactly one connection and one channel are ever opened. A failed
/// initialization leaves the manager empty; nothing retries on its own.
pub struct BrokerConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: BrokerTopology,
    connect_timeout: Duration,
    session: OnceCell<Session>,
}

impl BrokerConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: BrokerTopology,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            topology,
            connect_timeout,
            session: OnceCell::new(),
        }
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    pub fn is_connected(&self) -> bool {
        self.session.initialized()
    }

    /// Shared channel, opening the connection on first use.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let session = self
            .session
            .get_or_try_init(|| self.open_session())
            .await?;
        Ok(Arc::clone(&session.channel))
    }

    async fn open_session(&self) -> Result<Session> {
        let connection = self
            .bounded("connect", self.connector.connect())
            .await?;
        debug!("Broker connection opened");

        let channel = match self
            .bounded("channel open", connection.create_channel())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly("connection", connection.close()).await;
                return Err(e);
            }
        };
        debug!("Broker channel opened");

        if let Err(e) = self
            .bounded("topology", topology::declare(channel.as_ref(), &self.topology))
            .await
        {
            close_quietly("channel", channel.close()).await;
            close_quietly("connection", connection.close()).await;
            return Err(e);
        }

        info!(exchange = %self.topology.exchange, "Broker session ready");
        Ok(Session {
            connection,
            channel,
        })
    }

    /// Apply the connect timeout and fold every failure into `Unavailable`.
    async fn bounded<T>(&self, step: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BrokerError::Unavailable(format!("{} failed: {}", step, e))),
            Err(_) => Err(BrokerError::Unavailable(format!(
                "{} failed: {}",
                step,
                BrokerError::Timeout(self.connect_timeout)
            ))),
        }
    }

    /// Close the channel, then the connection. Errors are logged, not returned.
    pub async fn close(&self) {
        if let Some(session) = self.session.get() {
            close_quietly("channel", session.channel.close()).await;
            close_quietly("connection", session.connection.close()).await;
            info!("Broker session closed");
        }
    }
}

async fn close_quietly(what: &str, fut: impl Future<Output = Result<()>>) {
    if let Err(e) = fut.await {
        warn!(resource = what, error = %e, "Failed to close broker resource");
    }
}
