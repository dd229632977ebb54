//! WebSocket link between an [`AgentHandle`] and the relay.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rendezvous_proto::SignalMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::agent::AgentHandle;

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("invalid relay url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("relay url must use ws or wss, got `{0}`")]
    UnsupportedScheme(String),
    #[error("relay connect failed: {0}")]
    Connect(#[from] WsError),
}

/// The two pump tasks of a connected relay link.
pub struct RelayLink {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub fn relay_url(raw: &str) -> Result<Url, RelayClientError> {
    let url = Url::parse(raw).map_err(|source| RelayClientError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RelayClientError::UnsupportedScheme(other.to_string())),
    }
}

/// Connects to the relay and starts pumping frames both ways: inbound frames
/// are handed to the agent, and everything the agent emits on `outbound` is
/// written to the socket. Losing the socket in either direction is reported
/// to the agent as a transport failure.
pub async fn connect(
    url: &str,
    agent: AgentHandle,
    mut outbound: mpsc::UnboundedReceiver<SignalMessage>,
) -> Result<RelayLink, RelayClientError> {
    let url = relay_url(url)?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    tracing::debug!(target = "rendezvous::relay_client", url = %url, "relay websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let writer_agent = agent.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "rendezvous::relay_client", error = %err, "failed to encode message");
                    continue;
                }
            };
            tracing::trace!(
                target = "rendezvous::relay_client",
                event = "ws_out",
                kind = %message.kind(),
                len = text.len()
            );
            if let Err(err) = ws_write.send(Message::Text(text)).await {
                tracing::warn!(target = "rendezvous::relay_client", error = %err, "relay send failed");
                writer_agent.transport_failed();
                return;
            }
        }
        let _ = ws_write.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    tracing::trace!(
                        target = "rendezvous::relay_client",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    agent.deliver_text(&text);
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(
                        target = "rendezvous::relay_client",
                        event = "ws_in",
                        kind = "binary",
                        len = data.len()
                    );
                    agent.deliver_bytes(&data);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(
                                target = "rendezvous::relay_client",
                                "relay websocket closed: {err}"
                            );
                        }
                        _ => {
                            tracing::warn!(
                                target = "rendezvous::relay_client",
                                "relay websocket error: {err}"
                            );
                        }
                    }
                    break;
                }
            }
        }
        agent.transport_failed();
    });

    Ok(RelayLink { reader, writer })
}

impl RelayLink {
    /// Resolves once the relay side of the link has gone away.
    pub async fn wait_disconnected(&mut self) {
        let _ = (&mut self.reader).await;
    }

    /// Gives queued outbound messages up to `grace` to reach the relay, then
    /// drops the link. The writer drains once the agent has stopped and its
    /// outbound sender is gone.
    pub async fn finish(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.writer).await.is_err() {
            tracing::debug!(target = "rendezvous::relay_client", "writer did not drain in time");
            self.writer.abort();
        }
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn relay_url_requires_websocket_scheme() {
        assert!(relay_url("ws://localhost:3001").is_ok());
        assert!(relay_url("wss://relay.example.org/ws").is_ok());
        assert!(matches!(
            relay_url("http://localhost:3001"),
            Err(RelayClientError::UnsupportedScheme(scheme)) if scheme == "http"
        ));
        assert!(matches!(
            relay_url("not a url"),
            Err(RelayClientError::InvalidUrl { .. })
        ));
    }
}
