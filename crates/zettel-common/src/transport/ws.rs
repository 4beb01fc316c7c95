//! WebSocket connector. One binary message per frame.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{Channel, Connector, TransportError};

/// Opens WebSocket channels (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn connect(&self, url: &str) -> Result<WsChannel, TransportError> {
        let (stream, response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    source: Box::new(e),
                })?;
        debug!(url, status = %response.status(), "websocket connected");
        Ok(WsChannel { stream })
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Channel for WsChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| TransportError::Io(Box::new(e)))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Ok(Message::Text(text)) => {
                    warn!(len = text.len(), "unexpected text frame skipped");
                }
                // Pings are answered by tungstenite on the next write.
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Io(Box::new(e)))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close");
        }
    }
}
