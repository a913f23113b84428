//! Client side of the authentication handshake.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::framing::{FrameConfig, FrameError};
use crate::protocol::{
    AUTH_FAILED_VALIDATION, AUTH_SUCCESSFUL_WELCOME_PLAYER, OWNER_MISMATCH_CAVEAT,
    WELCOME_PREFIX, encode_ticket_message,
};
use crate::tcp_client::TcpClientTransport;
use crate::ticket::{TicketError, TicketIssuer};

/// Errors surfaced to client code.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connection is not up.
    #[error("not connected")]
    NotConnected,
    /// The message exceeds the frame limit.
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing failure while connecting.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    /// The ticket could not be issued.
    #[error("ticket error: {0}")]
    Ticket(#[from] TicketError),
}

/// Where the client is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// Connected, waiting for the server's welcome cue.
    AwaitingWelcome,
    /// Ticket sent, waiting for the verdict.
    TicketSent,
    /// The server accepted the ticket.
    Authenticated {
        /// The server flagged that the ticket owner differs.
        owner_mismatch: bool,
    },
    /// The server rejected the ticket.
    Rejected,
}

impl ClientState {
    /// Whether the connection is up.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::AwaitingWelcome | Self::TicketSent | Self::Authenticated { .. }
        )
    }
}

/// Pure client handshake state machine.
///
/// Answers the welcome cue with the ticket frame and tracks the verdict.
#[derive(Debug)]
pub struct ClientSession {
    state: ClientState,
    ticket: Vec<u8>,
}

impl ClientSession {
    /// Create a disconnected session that will present `ticket`.
    pub fn new(ticket: Vec<u8>) -> Self {
        Self {
            state: ClientState::Disconnected,
            ticket,
        }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Dialing started.
    pub fn on_connecting(&mut self) {
        self.state = ClientState::Connecting;
    }

    /// The transport connected.
    pub fn on_connected(&mut self) {
        self.state = ClientState::AwaitingWelcome;
    }

    /// The transport closed. A rejection stays visible.
    pub fn on_disconnected(&mut self, reason: &str) {
        if self.state == ClientState::Rejected || self.state == ClientState::Disconnected {
            return;
        }
        tracing::info!("Disconnected in {:?}: {}", self.state, reason);
        self.state = ClientState::Disconnected;
    }

    /// Handle one server message. Returns a message to send back, if any.
    pub fn on_message(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(payload);
        tracing::info!("Received message from server: '{}'", text);

        match self.state {
            ClientState::AwaitingWelcome if text.starts_with(WELCOME_PREFIX) => {
                match encode_ticket_message(&self.ticket) {
                    Ok(frame) => {
                        tracing::info!("Server welcomed us, sending {}-byte auth ticket", frame.len());
                        self.state = ClientState::TicketSent;
                        Some(frame)
                    }
                    Err(err) => {
                        tracing::error!("Cannot frame auth ticket: {}", err);
                        None
                    }
                }
            }
            ClientState::TicketSent if text.starts_with(AUTH_SUCCESSFUL_WELCOME_PLAYER) => {
                let owner_mismatch = text.ends_with(OWNER_MISMATCH_CAVEAT);
                if owner_mismatch {
                    tracing::warn!("Authenticated, but the server noted an owner mismatch");
                } else {
                    tracing::info!("Authenticated");
                }
                self.state = ClientState::Authenticated { owner_mismatch };
                None
            }
            ClientState::TicketSent if text == AUTH_FAILED_VALIDATION => {
                tracing::error!("Server rejected the auth ticket");
                self.state = ClientState::Rejected;
                None
            }
            _ => None,
        }
    }
}

/// Client driving a [`ClientSession`] over TCP.
pub struct GameClient {
    transport: TcpClientTransport,
    session: Mutex<ClientSession>,
    issuer: Mutex<TicketIssuer>,
}

impl GameClient {
    /// Issue a ticket and connect to `addr`.
    ///
    /// The ticket is cancelled again if the connection fails.
    pub async fn connect(
        addr: SocketAddr,
        mut issuer: TicketIssuer,
        frame: FrameConfig,
    ) -> Result<Self, ClientError> {
        let ticket = issuer.issue()?;
        let mut session = ClientSession::new(ticket);
        session.on_connecting();

        let transport = match TcpClientTransport::connect(addr, issuer.identity(), frame).await {
            Ok(transport) => transport,
            Err(err) => {
                issuer.cancel();
                return Err(err);
            }
        };
        session.on_connected();

        Ok(Self {
            transport,
            session: Mutex::new(session),
            issuer: Mutex::new(issuer),
        })
    }

    fn session(&self) -> MutexGuard<'_, ClientSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handshake state.
    pub fn state(&self) -> ClientState {
        self.session().state()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &TcpClientTransport {
        &self.transport
    }

    /// Process up to `max` received messages and return them as text.
    pub fn poll(&self, max: usize) -> Vec<String> {
        // The link queues every message before it reports the disconnect.
        let connected = self.transport.is_connected();
        let messages = self.transport.receive_batch(max);
        let drained = messages.len() < max;
        let mut received = Vec::with_capacity(messages.len());

        for message in messages {
            let reply = self.session().on_message(&message);
            if let Some(reply) = reply
                && let Err(err) = self.transport.send(&reply)
            {
                tracing::error!("Failed to send auth ticket: {}", err);
            }
            received.push(String::from_utf8_lossy(&message).into_owned());
        }

        if !connected && drained {
            let reason = self
                .transport
                .end_reason()
                .unwrap_or_else(|| "connection closed".to_string());
            self.session().on_disconnected(&reason);
        }
        received
    }

    /// Send a text message to the server.
    pub fn send_text(&self, text: &str) -> Result<(), ClientError> {
        if !self.state().is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.transport.send(text.as_bytes())?;
        tracing::info!("Sent message: '{}'", text);
        Ok(())
    }

    /// Close the connection and cancel the ticket.
    pub fn disconnect(&self) {
        self.transport.disconnect();
        self.session().on_disconnected("disconnected locally");
        self.issuer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}
