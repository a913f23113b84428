//! TCP transport for the server side of the gateway.
//!
//! Every accepted socket gets a [`ConnectionHandle`] and a background task.
//! The task waits for the owner to [`accept`](Transport::accept) it, reads
//! the transport hello, then shuttles framed messages: inbound ones into the
//! shared inbox drained by [`receive_batch`](Transport::receive_batch),
//! outbound ones from a per-connection queue onto the socket. Status changes
//! queue up until the owner pumps them (see [`CallbackSource`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{CallbackSource, EventSink};
use crate::framing::{FrameConfig, FrameError, parse_hello, read_frame, write_frame};
use crate::identity::{ConnectionHandle, HandleGenerator, Identity};
use crate::transport::{IncomingMessage, StatusChange, Transport, TransportError, TransportState};

/// Configuration for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to. Default: `0.0.0.0:1234`.
    pub bind_addr: SocketAddr,
    /// Framing limits.
    pub frame: FrameConfig,
    /// How long an accepted peer has to send its hello.
    pub hello_timeout: Duration,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            frame: FrameConfig::default(),
            hello_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpServerConfig {
    /// Build from the `server` config section.
    pub fn from_config(
        config: &turnstile_config::ServerConfig,
    ) -> Result<Self, std::net::AddrParseError> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port).parse()?;
        Ok(Self {
            bind_addr,
            ..Self::default()
        })
    }
}

/// Item on a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write one framed message.
    Frame(Vec<u8>),
    /// Flush what came before, then close the socket.
    Close,
}

/// How a connection's I/O loop ended.
#[derive(Debug)]
pub(crate) enum LinkEnd {
    /// The peer closed the stream cleanly.
    PeerClosed,
    /// Read or write failed.
    Failed(String),
    /// The local side asked to close.
    LocalClose,
}

/// Run the framed read/write loop for one established stream.
///
/// Inbound frames go to `on_message`. Returns when either side ends or
/// `shutdown_rx` fires.
pub(crate) async fn run_link(
    stream: TcpStream,
    frame: &FrameConfig,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    mut on_message: impl FnMut(Vec<u8>),
    shutdown_rx: &mut watch::Receiver<bool>,
) -> LinkEnd {
    let (mut reader, mut writer) = stream.into_split();

    let read_side = async {
        loop {
            match read_frame(&mut reader, frame).await {
                Ok(payload) => on_message(payload),
                Err(FrameError::ConnectionClosed) => return LinkEnd::PeerClosed,
                Err(err) => return LinkEnd::Failed(err.to_string()),
            }
        }
    };

    let write_side = async {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame(payload) => {
                    if let Err(err) = write_frame(&mut writer, &payload, frame).await {
                        return LinkEnd::Failed(err.to_string());
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
        LinkEnd::LocalClose
    };

    tokio::select! {
        end = read_side => end,
        end = write_side => end,
        _ = wait_for_shutdown(shutdown_rx) => LinkEnd::LocalClose,
    }
}

/// Resolve once `true` is published. A dropped sender never resolves.
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct PeerLink {
    state: TransportState,
    remote: Option<Identity>,
    outbound: mpsc::UnboundedSender<Outbound>,
    accept: Option<oneshot::Sender<()>>,
}

struct Shared {
    links: Mutex<HashMap<ConnectionHandle, PeerLink>>,
    inbox_tx: Sender<IncomingMessage>,
    inbox_rx: Receiver<IncomingMessage>,
    status_tx: Sender<StatusChange>,
    status_rx: Receiver<StatusChange>,
}

impl Shared {
    fn links(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, PeerLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_status(&self, change: StatusChange) {
        let _ = self.status_tx.send(change);
    }

    /// Move a still-registered link to `Connected`.
    fn establish(&self, handle: ConnectionHandle, remote: Option<Identity>) -> bool {
        let mut links = self.links();
        let Some(link) = links.get_mut(&handle) else {
            return false;
        };
        let old_state = link.state;
        link.state = TransportState::Connected;
        link.remote = remote;
        drop(links);

        self.push_status(StatusChange {
            handle,
            old_state,
            new_state: TransportState::Connected,
            remote_identity: remote,
            end_reason: None,
        });
        true
    }

    /// Drop a link that ended on its own and report it, unless it was
    /// already closed locally.
    fn finish(&self, handle: ConnectionHandle, end: LinkEnd) {
        let (new_state, reason) = match end {
            LinkEnd::PeerClosed => (TransportState::ClosedByPeer, "Closed by peer".to_string()),
            LinkEnd::Failed(reason) => (TransportState::ProblemDetectedLocally, reason),
            LinkEnd::LocalClose => {
                self.links().remove(&handle);
                return;
            }
        };

        let Some(link) = self.links().remove(&handle) else {
            return;
        };
        tracing::info!("Connection {} ended: {}", handle, reason);
        self.push_status(StatusChange {
            handle,
            old_state: link.state,
            new_state,
            remote_identity: link.remote,
            end_reason: Some(reason),
        });
    }
}

/// Tokio TCP implementation of [`Transport`].
pub struct TcpTransport {
    config: TcpServerConfig,
    shared: Arc<Shared>,
    handles: HandleGenerator,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TcpServerConfig) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                links: Mutex::new(HashMap::new()),
                inbox_tx,
                inbox_rx,
                status_tx,
                status_rx,
            }),
            handles: HandleGenerator::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("Accept failed: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {peer_addr}: {err}");
                    }
                    self.register(stream, peer_addr);
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    tracing::info!("Listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn register(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let handle = self.handles.next_handle();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = oneshot::channel();

        self.shared.links().insert(
            handle,
            PeerLink {
                state: TransportState::Connecting,
                remote: None,
                outbound,
                accept: Some(accept_tx),
            },
        );
        tracing::debug!("Connection {} knocking from {}", handle, peer_addr);
        self.shared.push_status(StatusChange {
            handle,
            old_state: TransportState::None,
            new_state: TransportState::Connecting,
            remote_identity: None,
            end_reason: None,
        });

        let shared = Arc::clone(&self.shared);
        let frame = self.config.frame.clone();
        let hello_timeout = self.config.hello_timeout;
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            Self::serve(
                shared,
                handle,
                stream,
                frame,
                hello_timeout,
                accept_rx,
                outbound_rx,
                shutdown_rx,
            )
            .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve(
        shared: Arc<Shared>,
        handle: ConnectionHandle,
        mut stream: TcpStream,
        frame: FrameConfig,
        hello_timeout: Duration,
        accept_rx: oneshot::Receiver<()>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let accepted = tokio::select! {
            result = accept_rx => result.is_ok(),
            _ = wait_for_shutdown(&mut shutdown_rx) => false,
        };
        if !accepted {
            // Closed locally before being accepted.
            return;
        }

        let hello = tokio::select! {
            result = tokio::time::timeout(hello_timeout, read_frame(&mut stream, &frame)) => result,
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
        };

        let remote = match hello {
            Ok(Ok(hello)) => parse_hello(&hello),
            Ok(Err(FrameError::ConnectionClosed)) => {
                shared.finish(handle, LinkEnd::PeerClosed);
                return;
            }
            Ok(Err(err)) => {
                shared.finish(handle, LinkEnd::Failed(err.to_string()));
                return;
            }
            Err(_) => {
                tracing::debug!("Connection {} sent no hello in {:?}", handle, hello_timeout);
                None
            }
        };

        if !shared.establish(handle, remote) {
            return;
        }

        let inbox = shared.inbox_tx.clone();
        let end = run_link(
            stream,
            &frame,
            &mut outbound_rx,
            |payload| {
                let _ = inbox.send(IncomingMessage { handle, payload });
            },
            &mut shutdown_rx,
        )
        .await;
        shared.finish(handle, end);
    }

    /// Number of connections the transport is tracking.
    pub fn link_count(&self) -> usize {
        self.shared.links().len()
    }

    /// Current transport state of a connection.
    pub fn link_state(&self, handle: ConnectionHandle) -> Option<TransportState> {
        self.shared.links().get(&handle).map(|link| link.state)
    }
}

impl Transport for TcpTransport {
    fn accept(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let mut links = self.shared.links();
        let link = links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if link.state != TransportState::Connecting {
            return Err(TransportError::InvalidState {
                handle,
                state: link.state,
            });
        }
        let accept = link.accept.take().ok_or(TransportError::InvalidState {
            handle,
            state: link.state,
        })?;
        accept.send(()).map_err(|_| TransportError::Closed(handle))
    }

    fn close(&self, handle: ConnectionHandle, reason: &str) {
        let Some(link) = self.shared.links().remove(&handle) else {
            return;
        };
        tracing::debug!("Closing connection {}: {}", handle, reason);
        // Queued frames are written before the close marker.
        let _ = link.outbound.send(Outbound::Close);
    }

    fn send(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.config.frame.max_payload_size as usize {
            return Err(TransportError::MessageTooLarge {
                handle,
                size: payload.len(),
            });
        }

        let links = self.shared.links();
        let link = links
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if link.state != TransportState::Connected {
            return Err(TransportError::InvalidState {
                handle,
                state: link.state,
            });
        }
        link.outbound
            .send(Outbound::Frame(payload.to_vec()))
            .map_err(|_| TransportError::Closed(handle))
    }

    fn receive_batch(&self, max: usize) -> Result<Vec<IncomingMessage>, TransportError> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.shared.inbox_rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    return Err(TransportError::QueueClosed);
                }
            }
        }
        Ok(batch)
    }

    fn shutdown(&self) {
        let remaining: Vec<_> = self.shared.links().drain().collect();
        for (handle, link) in remaining {
            tracing::debug!("Dropping connection {} on shutdown", handle);
            let _ = link.outbound.send(Outbound::Close);
        }
        let _ = self.shutdown_tx.send(true);
    }
}

impl CallbackSource for TcpTransport {
    fn pump(&self, sink: &dyn EventSink) -> usize {
        let changes: Vec<_> = self.shared.status_rx.try_iter().collect();
        let delivered = changes.len();
        for change in changes {
            sink.on_status_changed(change);
        }
        delivered
    }
}
