//! Relay connector

use iap_transport::{TransportError, TransportResult};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, AUTHORIZATION, ORIGIN, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::tungstenite::{self, handshake::client::Request};
use tracing::{debug, info};

use crate::config::{IapTarget, WebSocketConfig};
use crate::connection::{map_ws_error, WebSocketChannel};

/// WebSocket connector for establishing relay connections
pub struct WebSocketConnector {
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("proxy_host", &self.config.proxy_host)
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        ensure_crypto_provider();

        debug!("WebSocket connector created");
        Ok(Self { config })
    }

    /// Open a relay WebSocket to `target`
    pub async fn connect(&self, target: &IapTarget) -> TransportResult<WebSocketChannel> {
        target.validate()?;

        let request = self.build_request(target)?;
        let mut ws_config = WsProtocolConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        debug!("Connecting to relay: {}", request.uri());

        let connect =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), true);
        let (stream, response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_connect_error)?;

        let channel = WebSocketChannel::new(stream);
        info!(
            "[{}] Relay WebSocket established (HTTP {})",
            channel.connection_id(),
            response.status()
        );

        Ok(channel)
    }

    fn build_request(&self, target: &IapTarget) -> TransportResult<Request> {
        let url = self.config.connect_url(target)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Configuration(format!("Invalid request: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", self.config.token))?,
        );
        headers.insert(ORIGIN, header_value(&self.config.origin)?);
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            header_value(&self.config.subprotocol)?,
        );

        Ok(request)
    }
}

fn header_value(value: &str) -> TransportResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::Configuration(format!("Invalid header value: {}", e)))
}

fn map_connect_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => TransportError::Connect(format!(
            "Relay rejected WebSocket upgrade with HTTP {}",
            response.status()
        )),
        tungstenite::Error::Io(e) => TransportError::Connect(format!("Connect failed: {}", e)),
        other => match map_ws_error(other) {
            TransportError::WebSocket(msg) => TransportError::Connect(msg),
            mapped => mapped,
        },
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> WebSocketConnector {
        WebSocketConnector::new(Arc::new(WebSocketConfig::with_token("secret-token"))).unwrap()
    }

    #[test]
    fn test_request_headers() {
        let target = IapTarget::instance("p", "z", "vm", 22);
        let request = connector().build_request(&target).unwrap();

        let headers = request.headers();
        assert_eq!(headers[AUTHORIZATION], "Bearer secret-token");
        assert_eq!(headers[ORIGIN], "bot:iap-tunneler");
        assert_eq!(headers[SEC_WEBSOCKET_PROTOCOL], "relay.tunnel.cloudproxy.app");
        assert_eq!(request.uri().host(), Some("tunnel.cloudproxy.app"));
    }

    #[test]
    fn test_connector_rejects_missing_token() {
        let result = WebSocketConnector::new(Arc::new(WebSocketConfig::default()));
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }

    #[test]
    fn test_token_with_newline_rejected() {
        let connector =
            WebSocketConnector::new(Arc::new(WebSocketConfig::with_token("bad\ntoken"))).unwrap();
        let target = IapTarget::instance("p", "z", "vm", 22);
        assert!(connector.build_request(&target).is_err());
    }

    #[tokio::test]
    async fn test_invalid_target_fails_before_dialing() {
        let err = connector().connect(&IapTarget::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }
}
