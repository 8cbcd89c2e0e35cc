use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::Channel;
use crate::config::{Endpoint, SessionConfig};
use crate::error::{Result, SessionError};

/// Opens channels to the engine.
///
/// Sessions reconnect through this seam, so tests can hand out in-process
/// transports instead of sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Channel>;
}

/// Connects to the endpoint named in the session config
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointConnector;

impl EndpointConnector {
    async fn open(config: &SessionConfig) -> Result<Channel> {
        let max_frame_bytes = config.limits.max_frame_bytes;
        match &config.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Channel::new(stream, max_frame_bytes))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(SessionError::Configuration {
                parameter: "endpoint".to_string(),
                message: "unix sockets are not supported on this platform".to_string(),
            }),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Channel::new(stream, max_frame_bytes))
            }
        }
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Channel> {
        debug!(endpoint = %config.endpoint, "Connecting to engine");
        match tokio::time::timeout(config.timeouts.connect, Self::open(config)).await {
            Ok(Ok(channel)) => Ok(channel),
            // No engine is serving the model at this endpoint
            Ok(Err(SessionError::Io(e))) => Err(SessionError::InvalidModel(format!(
                "cannot reach engine at {}: {}",
                config.endpoint, e
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::timeout("connect", config.timeouts.connect)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Frame;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = Channel::new(stream, 1024);
            channel.receive(Duration::from_secs(1)).await.unwrap()
        });

        let config = SessionConfig {
            endpoint: Endpoint::Tcp(addr.to_string()),
            ..Default::default()
        };
        let channel = EndpointConnector.connect(&config).await.unwrap();
        channel.send_frame(&Frame::Ack).await.unwrap();
        assert_eq!(server.await.unwrap(), Frame::Ack);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_is_invalid_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            endpoint: Endpoint::Unix(dir.path().join("absent.sock")),
            ..Default::default()
        };
        let error = EndpointConnector.connect(&config).await.unwrap_err();
        assert!(matches!(error, SessionError::InvalidModel(_)));
        assert_eq!(error.code(), crate::error::ErrorCode::InvalidModel);
    }

    #[tokio::test]
    async fn test_refused_tcp_is_invalid_model() {
        // Bind then drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let config = SessionConfig {
            endpoint: Endpoint::Tcp(addr.to_string()),
            ..Default::default()
        };
        let error = EndpointConnector.connect(&config).await.unwrap_err();
        assert!(matches!(
            error.code(),
            crate::error::ErrorCode::InvalidModel | crate::error::ErrorCode::Timeout
        ));
    }
}
