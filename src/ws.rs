//! Default WebSocket transport for relay connections.
//!
//! One spawned task per connection owns both halves of the socket: outbound
//! frames come from the pool over a channel, inbound text frames are parsed
//! into [`crate::wire::RelayMessage`]s. Dropping the outbound sender closes
//! the socket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info};

use crate::conn::{Connector, ConnectorHandle};
use crate::wire;

/// tokio-tungstenite-backed [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<ConnectorHandle> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("WebSocket connection to {url} failed"))?;
        info!("Connected to '{url}'");
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let url = url.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                                let _ = err_tx.send(format!("write failed: {e}"));
                                break;
                            }
                        }
                        None => {
                            // Pool closed the connection
                            write.close().await.ok();
                            break;
                        }
                    },
                    msg = read.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if in_tx.send(wire::parse(&text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await.ok();
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            debug!("Relay {url} sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = err_tx.send(format!("read failed: {e}"));
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Transport loop for {url} ended");
        });

        Ok(ConnectorHandle {
            outbound: out_tx,
            inbound: in_rx,
            errors: err_rx,
        })
    }
}
