//! WebSocket implementation of the transport seam.
//!
//! Every protocol frame travels as one WebSocket text message. Binary
//! messages are accepted and decoded lossily as UTF-8; ping/pong control
//! frames are answered by tungstenite and skipped here.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use url::Url;

use crate::Error;
use crate::protocol::subscribe_command;
use crate::transport::{
    RequestSocket, SubscriberReader, SubscriberSocket, SubscriberWriter, Transport,
};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

async fn connect(endpoint: &Url) -> Result<WsStream, Error> {
    let (ws, _resp) = tokio_tungstenite::connect_async(endpoint.as_str())
        .await
        .map_err(|e| Error::Connect(format!("{endpoint}: {e}")))?;
    Ok(ws)
}

/// Pull the next text payload off a WebSocket stream.
async fn next_text<S>(stream: &mut S) -> Result<String, Error>
where
    S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame? {
            tungstenite::Message::Text(text) => return Ok(text.as_str().to_owned()),
            tungstenite::Message::Binary(data) => {
                return Ok(String::from_utf8_lossy(&data).into_owned());
            }
            tungstenite::Message::Close(_) => return Err(Error::Closed),
            _ => {
                // Ignore ping, pong and raw frames
            }
        }
    }
    Err(Error::Closed)
}

/// Transport that speaks the broker protocol over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn subscriber(&self, endpoint: &Url) -> Result<SubscriberSocket, Error> {
        let (write, read) = connect(endpoint).await?.split();
        Ok(SubscriberSocket {
            reader: Box::new(WsSubscriberReader { read }),
            writer: Box::new(WsSubscriberWriter { write }),
        })
    }

    async fn request(&self, endpoint: &Url) -> Result<Box<dyn RequestSocket>, Error> {
        let ws = connect(endpoint).await?;
        Ok(Box::new(WsRequestSocket { ws }))
    }
}

struct WsSubscriberReader {
    read: WsRead,
}

#[async_trait]
impl SubscriberReader for WsSubscriberReader {
    async fn recv(&mut self) -> Result<String, Error> {
        next_text(&mut self.read).await
    }
}

struct WsSubscriberWriter {
    write: WsWrite,
}

#[async_trait]
impl SubscriberWriter for WsSubscriberWriter {
    async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        self.write
            .send(tungstenite::Message::Text(subscribe_command(topic).into()))
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!("Subscriber close failed: {e}");
        }
    }
}

struct WsRequestSocket {
    ws: WsStream,
}

#[async_trait]
impl RequestSocket for WsRequestSocket {
    async fn send(&mut self, payload: &str) -> Result<(), Error> {
        self.ws
            .send(tungstenite::Message::Text(payload.into()))
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, Error> {
        next_text(&mut self.ws).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!("Request socket close failed: {e}");
        }
    }
}
