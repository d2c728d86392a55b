//! Waits for the runtime to publish its service endpoint, then connects.

use std::{io, time::Duration};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::{VmEventReceiver, VmServiceClient};

/// Source of the runtime service endpoint, typically the process that
/// launched the application. Returns `None` until the endpoint is known.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self) -> Option<String>;
}

impl<F> EndpointProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn endpoint(&self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("invalid runtime service endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("failed to connect to the runtime service at {endpoint}: {source}")]
    Failed {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// An established channel plus its ordered event stream.
pub struct Connection {
    pub endpoint: String,
    pub client: VmServiceClient,
    pub events: VmEventReceiver,
}

/// Poll `provider` every `poll_interval` until it yields an endpoint, then
/// make a single connection attempt.
///
/// The wait has no upper bound: it ends when the endpoint appears or `cancel`
/// fires. A failed connection attempt is terminal and is not retried.
pub async fn connect(
    provider: &dyn EndpointProvider,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> Result<Connection, ConnectError> {
    let endpoint = loop {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        if let Some(endpoint) = provider.endpoint() {
            break endpoint;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    };

    let address = socket_address(&endpoint)?;
    tracing::info!(target: "kite.vmservice", %endpoint, "connecting to runtime service");

    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
        res = TcpStream::connect(address.as_str()) => res,
    }
    .map_err(|source| ConnectError::Failed {
        endpoint: endpoint.clone(),
        source,
    })?;
    let _ = stream.set_nodelay(true);

    let (client, events) = VmServiceClient::from_stream(stream);
    Ok(Connection {
        endpoint,
        client,
        events,
    })
}

/// Extract `host:port` from `tcp://`/`ws://` URLs or a bare `host:port`.
pub fn socket_address(endpoint: &str) -> Result<String, ConnectError> {
    let invalid = |reason: &str| ConnectError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = endpoint.trim();
    if !trimmed.contains("://") {
        if trimmed.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }) {
            return Ok(trimmed.to_string());
        }
        return Err(invalid("expected host:port"));
    }

    let url = Url::parse(trimmed).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(url.scheme(), "tcp" | "ws" | "http") {
        return Err(invalid("unsupported scheme"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;
    if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}
