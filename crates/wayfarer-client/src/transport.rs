//! Transport abstraction.
//!
//! The socket actor only needs to open a channel and then exchange text frames,
//! so both sides are traits: a [`Connector`] opens a [`Transport`] for a channel.
//! [`WsConnector`] is the production implementation on top of `tokio-tungstenite`.

use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wayfarer_core::{Channel, Credential};

/// A connected, bidirectional text-frame transport.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports for a channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        channel: Channel,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects to `<endpoint>/<channel>` over WebSocket, sending the credential as
/// a bearer `Authorization` header on the upgrade request.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn channel_url(&self, channel: Channel) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), channel.path())
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        channel: Channel,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let url = self.channel_url(channel);
        let mut request = url.as_str().into_client_request()?;
        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&credential.bearer())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        tracing::debug!("Opening {}", url);
        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => return None,
                // pings are answered by tungstenite; binary frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
