//! Steps run on a fresh connection before it carries ordinary operations
//!
//! The connector runs its steps in order; the first failure closes the
//! connection and fails the connect attempt. Authentication or other
//! handshakes plug in as additional [`ActivationStep`]s.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::connection::WireConnection;
use crate::error::{HotRodError, HotRodResult};
use crate::operations::{ErasedOperation, PendingOperation, PingOperation, PingResponse, QueuedOperation};
use crate::protocol::{codec_for_version, DEFAULT_CACHE_NAME};

#[async_trait]
pub trait ActivationStep: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn activate(&self, connection: &Arc<WireConnection>) -> HotRodResult<()>;
}

/// Send an operation on a connection that is not handed out yet
pub(crate) async fn send_on_connection<O>(
    connection: &WireConnection,
    operation: O,
    limit: Duration,
) -> HotRodResult<O::Output>
where
    O: crate::operations::Operation,
{
    let pending = PendingOperation::new(0, operation);
    let (attempt, rx) = pending.begin_attempt();
    let erased: Arc<dyn ErasedOperation> = pending;
    connection.force_send(QueuedOperation::new(erased, attempt));

    match timeout(limit, rx).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(failure))) => Err(failure.error),
        Ok(Err(_)) => Err(HotRodError::internal("Operation dropped before completion")),
        Err(_) => Err(HotRodError::transport(
            connection.address(),
            format!("No response within {:?}", limit),
        )),
    }
}

/// Ping the server and adopt its protocol version when it is lower than ours
#[derive(Debug, Clone)]
pub struct PingActivation {
    timeout: Duration,
}

impl PingActivation {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ActivationStep for PingActivation {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn activate(&self, connection: &Arc<WireConnection>) -> HotRodResult<()> {
        let response: PingResponse =
            send_on_connection(connection, PingOperation::new(DEFAULT_CACHE_NAME), self.timeout).await?;

        let current = connection.codec().version();
        if response.server_version != 0 && response.server_version < current {
            match codec_for_version(response.server_version) {
                Some(codec) => connection.install_codec(codec),
                None => warn!(
                    address = %connection.address(),
                    server_version = response.server_version,
                    "Server prefers an unsupported protocol version, keeping {}",
                    current
                ),
            }
        }
        debug!(
            address = %connection.address(),
            version = connection.codec().version(),
            operations = response.supported_operations.len(),
            "Ping activation complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{VERSION_30, VERSION_31};
    use crate::testing::{detached_events, MockServer};
    use crate::transport::connection::Connector;
    use crate::transport::TransportSettings;

    fn connector(steps: Vec<Arc<dyn ActivationStep>>) -> Connector {
        Connector::new(TransportSettings::default(), detached_events(), steps)
    }

    #[tokio::test]
    async fn test_ping_negotiates_lower_version() {
        let server = MockServer::start().await;
        server.set_server_version(VERSION_30);

        let step: Arc<dyn ActivationStep> = Arc::new(PingActivation::new(Duration::from_secs(5)));
        let connection = connector(vec![step]).connect(&server.address()).await.unwrap();
        assert_eq!(connection.codec().version(), VERSION_30);
        connection.close();
    }

    #[tokio::test]
    async fn test_ping_keeps_version() {
        let server = MockServer::start().await;

        let step: Arc<dyn ActivationStep> = Arc::new(PingActivation::new(Duration::from_secs(5)));
        let connection = connector(vec![step]).connect(&server.address()).await.unwrap();
        assert_eq!(connection.codec().version(), VERSION_31);
        connection.close();
    }

    #[tokio::test]
    async fn test_failed_activation_fails_connect() {
        let server = MockServer::start().await;
        server.fail_pings();

        let step: Arc<dyn ActivationStep> = Arc::new(PingActivation::new(Duration::from_secs(5)));
        let result = connector(vec![step]).connect(&server.address()).await;
        assert!(matches!(result, Err(HotRodError::Transport { .. })));
    }
}
