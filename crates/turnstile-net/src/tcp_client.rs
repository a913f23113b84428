//! TCP transport for the client side of the gateway.
//!
//! One outbound connection, framed the same way as [`crate::tcp_server`].
//! State changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Receiver;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::client::ClientError;
use crate::framing::{FrameConfig, encode_hello, write_frame};
use crate::identity::Identity;
use crate::tcp_server::{LinkEnd, Outbound, run_link};

/// Socket-level state of the client link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing.
    Connecting,
    /// Hello sent; frames flow.
    Connected,
    /// Closed by either side, or never opened.
    Disconnected,
}

/// [`ConnectionState`] published on a [`watch`] channel.
#[derive(Debug)]
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(ConnectionState::Disconnected),
        }
    }
}

impl ConnectionStateWatch {
    /// Starts out [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `state`, even with no subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Client end of a framed TCP connection.
///
/// Created via [`TcpClientTransport::connect`], which also sends the
/// transport hello asserting the local identity.
pub struct TcpClientTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbox: Receiver<Vec<u8>>,
    state: Arc<ConnectionStateWatch>,
    end_reason: Arc<Mutex<Option<String>>>,
    max_payload_size: usize,
}

impl TcpClientTransport {
    /// Connect to `addr` as `identity`.
    ///
    /// Sets `TCP_NODELAY`, sends the hello, and spawns the link task.
    /// Returns immediately after the hello is written.
    pub async fn connect(
        addr: SocketAddr,
        identity: Identity,
        frame: FrameConfig,
    ) -> Result<Self, ClientError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                state.set(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &encode_hello(identity), &frame).await?;

        state.set(ConnectionState::Connected);
        tracing::info!("Connected to {} as {}", addr, identity);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        let end_reason = Arc::new(Mutex::new(None));
        let max_payload_size = frame.max_payload_size as usize;

        let link_state = Arc::clone(&state);
        let link_end = Arc::clone(&end_reason);
        tokio::spawn(async move {
            // The client link only ends through its outbound queue or the socket.
            let (_never, mut shutdown_rx) = watch::channel(false);
            let end = run_link(
                stream,
                &frame,
                &mut outbound_rx,
                |payload| {
                    let _ = inbox_tx.send(payload);
                },
                &mut shutdown_rx,
            )
            .await;

            let reason = match end {
                LinkEnd::PeerClosed => "Closed by server".to_string(),
                LinkEnd::Failed(reason) => reason,
                LinkEnd::LocalClose => "Disconnected locally".to_string(),
            };
            tracing::info!("Connection to {} ended: {}", addr, reason);
            *link_end.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
            link_state.set(ConnectionState::Disconnected);
        });

        Ok(Self {
            outbound,
            inbox,
            state,
            end_reason,
            max_payload_size,
        })
    }

    /// Link state, for callers that want to await changes.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.state.current() == ConnectionState::Connected
    }

    /// Why the link ended, once it has.
    pub fn end_reason(&self) -> Option<String> {
        self.end_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue a message for the server.
    pub fn send(&self, payload: &[u8]) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if payload.len() > self.max_payload_size {
            return Err(ClientError::MessageTooLarge(payload.len()));
        }
        self.outbound
            .send(Outbound::Frame(payload.to_vec()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Drain up to `max` received messages.
    pub fn receive_batch(&self, max: usize) -> Vec<Vec<u8>> {
        self.inbox.try_iter().take(max).collect()
    }

    /// Flush queued messages and close the connection.
    ///
    /// The state becomes [`ConnectionState::Disconnected`] immediately.
    pub fn disconnect(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.state.set(ConnectionState::Disconnected);
    }
}
