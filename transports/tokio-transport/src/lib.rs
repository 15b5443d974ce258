//! Tokio-based WebSocket transport for the duochat relay.
//!
//! Each relay event travels as one text frame. The credential is attached to
//! the upgrade request both as a bearer header and as a `token` query
//! parameter.

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use duocore::auth::Credential;
use duocore::net::{Transport, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow!("Socket is closed"))?;

        let text = std::str::from_utf8(data).map_err(|e| anyhow!("Frame is not UTF-8: {e}"))?;
        debug!("--> Sending frame: {} bytes", data.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| anyhow!("WebSocket send error: {e}"))
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                trace!("Error closing websocket sink: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports against one relay URL.
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Appends the credential as a `token` query parameter.
fn authenticated_url(base: &str, credential: &Credential) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}token={}",
        urlencoding::encode(&credential.token)
    )
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        credential: &Credential,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {}", self.url);
        let mut request = authenticated_url(&self.url, credential)
            .into_client_request()
            .map_err(|e| anyhow!("Failed to build request: {e}"))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|e| anyhow!("Credential is not a valid header value: {e}"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (client, _response) = connect_async(request)
            .await
            .map_err(|e| anyhow!("WebSocket connect failed: {e}"))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() || msg.is_binary() {
                    let data: Bytes = msg.into_data();
                    debug!("<-- Received frame: {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::DataReceived(data))
                        .await
                        .is_err()
                    {
                        warn!("Event receiver dropped, closing read pump");
                        break;
                    }
                } else if msg.is_close() {
                    trace!("Received close frame");
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_url_encoded_into_query() {
        let cred = Credential::new("a b&c");
        assert_eq!(
            authenticated_url("wss://relay.example.com/ws", &cred),
            "wss://relay.example.com/ws?token=a%20b%26c"
        );
    }

    #[test]
    fn token_is_appended_to_existing_query() {
        let cred = Credential::new("t");
        assert_eq!(
            authenticated_url("wss://relay.example.com/ws?v=2", &cred),
            "wss://relay.example.com/ws?v=2&token=t"
        );
    }
}
