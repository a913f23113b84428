//! Authenticated connection gateway: ticket framing, per-connection auth
//! state, dispatch, and the transports and ticket services behind them.

pub mod auth;
pub mod client;
pub mod events;
pub mod framing;
pub mod gateway;
pub mod identity;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod tcp_client;
pub mod tcp_server;
pub mod ticket;
pub mod transport;
pub mod validation;

pub use auth::{Action, Admission, AuthState, ConnectionRecord};
pub use client::{ClientError, ClientSession, ClientState, GameClient};
pub use events::{CallbackSource, EventSink, run_callbacks};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use gateway::{Gateway, GatewayConfig};
pub use identity::{ConnectionHandle, HandleGenerator, Identity};
pub use loopback::{LoopbackTransport, ScriptedValidator};
pub use protocol::{MalformedFrame, decode_ticket_message, encode_ticket_message};
pub use registry::{ConnectionRegistry, RegistryError};
pub use tcp_client::{ConnectionState, ConnectionStateWatch, TcpClientTransport};
pub use tcp_server::{TcpServerConfig, TcpTransport};
pub use ticket::{AuthorityValidator, TicketAuthority, TicketError, TicketIssuer};
pub use transport::{IncomingMessage, StatusChange, Transport, TransportError, TransportState};
pub use validation::{TicketValidator, ValidationOutcome, ValidationResult};
