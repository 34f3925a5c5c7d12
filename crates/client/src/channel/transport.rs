//! WebSocket seam for batch and group channels
//!
//! A [`Connection`] is a pair of unbounded queues plus a readiness flag the
//! actor polls to notice sockets that died without a close frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::StudyError;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Whether the underlying socket is still usable
#[derive(Debug, Clone)]
pub struct ReadyState(Arc<AtomicBool>);

impl ReadyState {
    pub fn new(open: bool) -> Self {
        Self(Arc::new(AtomicBool::new(open)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One live socket. Dropping `outbound` closes it.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    pub ready: ReadyState,
}

pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, StudyError>>;
}

/// tokio-tungstenite transport
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, StudyError>> {
        let url = url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| StudyError::Transport(err.to_string()))?;
            let (mut sink, mut stream) = ws.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let ready = ReadyState::new(true);

            let writer_ready = ready.clone();
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(err) = sink.send(Message::text(text)).await {
                        debug!(
                            component = "channel",
                            event = "channel.transport.write_failed",
                            error = %err,
                            "WebSocket write failed"
                        );
                        writer_ready.mark_closed();
                        return;
                    }
                }
                writer_ready.mark_closed();
                let _ = sink.close().await;
            });

            let reader_ready = ready.clone();
            tokio::spawn(async move {
                let closing = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(TransportEvent::Text(text.to_string())).is_err() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                                .unwrap_or((None, String::new()));
                            break Some(TransportEvent::Closed { code, reason });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(
                                component = "channel",
                                event = "channel.transport.read_failed",
                                error = %err,
                                "WebSocket read failed"
                            );
                            break Some(TransportEvent::Error(err.to_string()));
                        }
                        None => {
                            break Some(TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            })
                        }
                    }
                };
                reader_ready.mark_closed();
                if let Some(event) = closing {
                    let _ = in_tx.send(event);
                }
            });

            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
                ready,
            })
        }
        .boxed()
    }
}
