use std::sync::Arc;

use super::handle::Session;
use crate::channel::{Connector, EndpointConnector};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::processing::ChunkSink;

/// Builder for constructing a Session
pub struct SessionBuilder {
    config: Option<SessionConfig>,
    connector: Option<Arc<dyn Connector>>,
    sink: Option<Box<dyn ChunkSink>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            connector: None,
            sink: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the socket connector, e.g. with an in-process transport
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sink for chunks of streaming requests
    pub fn with_sink(mut self, sink: impl ChunkSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Validate the configuration and create an uninitialized session
    pub fn build(self) -> Result<Session> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(EndpointConnector));
        Ok(Session::from_parts(Arc::new(config), connector, self.sink))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Session over the endpoint named in `config`
    pub fn new(config: SessionConfig) -> Result<Self> {
        SessionBuilder::new().with_config(config).build()
    }
}
