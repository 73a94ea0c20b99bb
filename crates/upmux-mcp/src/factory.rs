//! Transport selection by kind.

use std::sync::Arc;

use upmux_core::{TokenStore, Transport, TransportError, TransportFactory, TransportKind};

use crate::http::HttpTransport;
use crate::stdio::StdioTransport;

/// The production transport set: stdio, HTTP and streamable HTTP.
pub struct McpTransportFactory {
    stdio: Arc<StdioTransport>,
    http: Arc<HttpTransport>,
    streamable: Arc<HttpTransport>,
}

impl McpTransportFactory {
    pub fn new(tokens: Arc<dyn TokenStore>) -> Result<Self, TransportError> {
        Ok(Self {
            stdio: Arc::new(StdioTransport::new()),
            http: Arc::new(
                HttpTransport::new(TransportKind::Http)?.with_token_store(Arc::clone(&tokens)),
            ),
            streamable: Arc::new(
                HttpTransport::new(TransportKind::StreamableHttp)?.with_token_store(tokens),
            ),
        })
    }
}

impl TransportFactory for McpTransportFactory {
    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Stdio => Arc::clone(&self.stdio) as Arc<dyn Transport>,
            TransportKind::Http => Arc::clone(&self.http) as Arc<dyn Transport>,
            TransportKind::StreamableHttp => Arc::clone(&self.streamable) as Arc<dyn Transport>,
        }
    }
}
