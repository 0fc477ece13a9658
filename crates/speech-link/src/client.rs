//! Auto-reconnecting client for the speech-processor link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{Envelope, FragmentDescriptor, Frame};
use crate::{LinkError, Result};

/// Default cap on a single binary payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 10 * 1024 * 1024;

const OUTBOUND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Link connection settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Processor WebSocket URL.
    pub url: String,
    /// Reconnect attempts before the link gives up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Cap on a single inbound binary payload.
    pub max_payload_bytes: usize,
}

impl LinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Events surfaced to the pipeline.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected { reason: String },
    Subscribed { stream_id: String },
    FragmentProcessed {
        descriptor: FragmentDescriptor,
        data: Bytes,
        metadata: Option<serde_json::Value>,
    },
    FragmentError { fragment_id: String, message: String },
    StreamComplete { stream_id: String },
    ProtocolError { message: String },
    /// Reconnect attempts exhausted or the client was closed; no further
    /// events will follow.
    Closed,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Persistent, auto-reconnecting link to the speech processor.
///
/// `connect` spawns a management task owning the socket; the handle sends
/// frames through a channel and receives typed [`LinkEvent`]s.
pub struct LinkClient {
    outbound_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LinkClient {
    /// Establish and maintain a connection, returning the handle and the
    /// event stream.
    pub fn connect(config: LinkConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_link(
            config,
            outbound_rx,
            event_tx,
            shutdown.clone(),
            connected.clone(),
        ));

        (
            Self {
                outbound_tx,
                shutdown,
                connected,
                task: tokio::sync::Mutex::new(Some(task)),
            },
            event_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one processing request: descriptor envelope plus audio payload.
    pub async fn send_fragment(
        &self,
        descriptor: FragmentDescriptor,
        bytes: Bytes,
    ) -> Result<()> {
        self.send(Frame::with_payload(
            Envelope::FragmentData {
                fragment: descriptor,
            },
            bytes,
        ))
        .await
    }

    pub async fn subscribe(&self, stream_id: impl Into<String>) -> Result<()> {
        self.send(Frame::new(Envelope::Subscribe {
            stream_id: stream_id.into(),
        }))
        .await
    }

    pub async fn unsubscribe(&self, stream_id: impl Into<String>) -> Result<()> {
        self.send(Frame::new(Envelope::Unsubscribe {
            stream_id: stream_id.into(),
        }))
        .await
    }

    pub async fn ack_fragment(&self, fragment_id: impl Into<String>) -> Result<()> {
        self.send(Frame::new(Envelope::FragmentAck {
            fragment_id: fragment_id.into(),
        }))
        .await
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Close the link and wait for the management task to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn run_link(
    config: LinkConfig,
    mut outbound_rx: mpsc::Receiver<Frame>,
    event_tx: mpsc::Sender<LinkEvent>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(&config.url) => result,
        };

        let stream = match stream {
            Ok((stream, _)) => {
                info!(url = %config.url, "Connected to speech processor");
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                let _ = event_tx.send(LinkEvent::Connected).await;
                stream
            }
            Err(e) => {
                warn!(url = %config.url, "Connection failed: {e}");
                attempt += 1;
                if attempt >= config.max_reconnect_attempts {
                    error!(
                        url = %config.url,
                        "Max reconnect attempts ({}) reached",
                        config.max_reconnect_attempts
                    );
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_delay) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }
        };

        let reason = drive_connection(
            stream,
            &config,
            &mut outbound_rx,
            &event_tx,
            &shutdown,
        )
        .await;
        connected.store(false, Ordering::SeqCst);

        match reason {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost(reason) => {
                warn!(url = %config.url, "Link lost: {reason}");
                let _ = event_tx.send(LinkEvent::Disconnected { reason }).await;
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let _ = event_tx.send(LinkEvent::Closed).await;
    debug!("Link task stopped");
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

async fn drive_connection(
    mut stream: WsStream,
    config: &LinkConfig,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    event_tx: &mpsc::Sender<LinkEvent>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = stream.close(None).await;
                return SessionEnd::Shutdown;
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = stream.close(None).await;
                    return SessionEnd::Shutdown;
                };
                let message = match frame.encode() {
                    Ok(message) => message,
                    Err(e) => {
                        error!("Failed to encode frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = stream.send(message).await {
                    return SessionEnd::Lost(format!("send failed: {e}"));
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(message)) => {
                        match Frame::decode(message, config.max_payload_bytes) {
                            Ok(Some(frame)) => {
                                if let Some(event) = event_for(frame) {
                                    if event_tx.send(event).await.is_err() {
                                        return SessionEnd::Shutdown;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Failed to decode inbound frame: {e}");
                                let _ = event_tx
                                    .send(LinkEvent::ProtocolError { message: e.to_string() })
                                    .await;
                            }
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("receive failed: {e}")),
                    None => return SessionEnd::Lost("stream closed by peer".to_string()),
                }
            }
        }
    }
}

fn event_for(frame: Frame) -> Option<LinkEvent> {
    match frame.envelope {
        Envelope::Subscribed { stream_id } => Some(LinkEvent::Subscribed { stream_id }),
        Envelope::FragmentProcessed { fragment, metadata } => {
            let Some(data) = frame.payload else {
                warn!(id = %fragment.id, "fragment:processed without payload");
                return Some(LinkEvent::FragmentError {
                    fragment_id: fragment.id,
                    message: "Processor response carried no audio payload".to_string(),
                });
            };
            Some(LinkEvent::FragmentProcessed {
                descriptor: fragment,
                data,
                metadata,
            })
        }
        Envelope::FragmentError {
            fragment_id,
            message,
        } => Some(LinkEvent::FragmentError {
            fragment_id,
            message,
        }),
        Envelope::StreamComplete { stream_id } => Some(LinkEvent::StreamComplete { stream_id }),
        Envelope::Error { message } => Some(LinkEvent::ProtocolError { message }),
        // Client-to-server envelopes are ignored if a peer echoes them back.
        Envelope::Subscribe { .. }
        | Envelope::Unsubscribe { .. }
        | Envelope::FragmentAck { .. }
        | Envelope::FragmentData { .. } => None,
    }
}
