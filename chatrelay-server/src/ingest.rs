use std::{future::Future, io, net::SocketAddr};

use chatrelay_core::{
    CoreError, DEFAULT_RECV_BUFFER_BYTES, Message, TimestampMillis, decode_record,
};
use thiserror::Error;
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::store::{ChatDatabase, MessageStore, PeerStore, StorageError};

const PAYLOAD_PREVIEW_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("decode failed: {0}")]
    Decode(#[from] CoreError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("socket fault: {0}")]
    SocketFault(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestState {
    /// Blocked on the socket, waiting for the next datagram.
    Waiting,
    /// The socket failed; no further datagrams will be read.
    Faulted(String),
    /// Shut down on request.
    Stopped,
}

/// Turns datagram payloads into store mutations. Holds no state of its own.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    peers: PeerStore,
    messages: MessageStore,
}

impl RecordWriter {
    pub fn new(database: &ChatDatabase) -> Self {
        Self {
            peers: database.peers(),
            messages: database.messages(),
        }
    }

    /// Decodes one payload, upserts its sender and appends its message.
    ///
    /// The peer is written first so the sender's state is current by the
    /// time the message becomes visible.
    pub fn ingest(
        &self,
        payload: &[u8],
        received_at_ms: TimestampMillis,
    ) -> Result<Message, IngestError> {
        let record = decode_record(payload, received_at_ms)?;
        self.peers.upsert(&record.to_peer())?;
        let stored = self.messages.append(&record.to_message())?;
        Ok(stored)
    }
}

/// Datagram transport read by an [`IngestLoop`]. Any error from `recv_from`
/// faults the loop.
pub trait DatagramSource: Send + Sync + 'static {
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSource for UdpSocket {
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Receive loop bound to one datagram socket.
#[derive(Debug)]
pub struct IngestLoop<S = UdpSocket> {
    socket: S,
    writer: RecordWriter,
    recv_buffer_bytes: usize,
}

impl IngestLoop<UdpSocket> {
    pub async fn bind(
        address: impl ToSocketAddrs,
        database: &ChatDatabase,
    ) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(IngestError::SocketFault)?;
        Ok(Self::from_socket(socket, database))
    }
}

impl<S: DatagramSource> IngestLoop<S> {
    pub fn from_socket(socket: S, database: &ChatDatabase) -> Self {
        Self {
            socket,
            writer: RecordWriter::new(database),
            recv_buffer_bytes: DEFAULT_RECV_BUFFER_BYTES,
        }
    }

    #[must_use]
    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer_bytes = bytes.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngestError> {
        self.socket.local_addr().map_err(IngestError::SocketFault)
    }

    /// Moves the loop onto its own task. The socket is released when the task
    /// ends, whether through shutdown, a fault, or the handle being dropped.
    pub fn spawn(self) -> Result<IngestHandle, IngestError> {
        let local_addr = self.local_addr()?;
        let (state_tx, state_rx) = watch::channel(IngestState::Waiting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(state_tx, shutdown_rx));
        Ok(IngestHandle {
            local_addr,
            state_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn run(
        self,
        state_tx: watch::Sender<IngestState>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let IngestLoop {
            socket,
            writer,
            recv_buffer_bytes,
        } = self;
        let mut buf = vec![0_u8; recv_buffer_bytes];

        info!(
            "ingest loop listening on {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned())
        );

        let final_state = loop {
            let received = tokio::select! {
                biased;
                _ = &mut shutdown => break IngestState::Stopped,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, source) = match received {
                Ok(received) => received,
                Err(err) => {
                    error!("receive failed, ingest loop faulted: {}", err);
                    break IngestState::Faulted(err.to_string());
                }
            };

            if len == buf.len() {
                warn!(
                    "datagram from {} filled the {} byte receive buffer and may be truncated",
                    source, len
                );
            }
            handle_datagram(&writer, &buf[..len], source);
        };

        drop(socket);
        info!("ingest loop exited: {:?}", final_state);
        state_tx.send_replace(final_state);
    }
}

fn handle_datagram(writer: &RecordWriter, payload: &[u8], source: SocketAddr) {
    let received_at_ms = chrono::Utc::now().timestamp_millis();
    match writer.ingest(payload, received_at_ms) {
        Ok(message) => info!(
            "stored message {} from {} ({}) in room {:?}",
            message.id.unwrap_or_default(),
            message.sender,
            source,
            message.chatroom
        ),
        Err(IngestError::Decode(err)) if err.is_benign() => {
            debug!("skipping datagram from {}: {}", source, err);
        }
        Err(IngestError::Decode(err)) => warn!(
            "dropping undecodable datagram from {}: {} (payload starts {})",
            source,
            err,
            hex::encode(&payload[..payload.len().min(PAYLOAD_PREVIEW_BYTES)])
        ),
        Err(err) => error!("datagram from {} not persisted: {}", source, err),
    }
}

/// Control side of a running [`IngestLoop`].
#[derive(Debug)]
pub struct IngestHandle {
    local_addr: SocketAddr,
    state_rx: watch::Receiver<IngestState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl IngestHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> IngestState {
        self.state_rx.borrow().clone()
    }

    pub fn is_healthy(&self) -> bool {
        matches!(*self.state_rx.borrow(), IngestState::Waiting)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IngestState> {
        self.state_rx.clone()
    }

    /// Resolves once the loop has left the waiting state.
    pub async fn finished(&mut self) -> IngestState {
        match self
            .state_rx
            .wait_for(|state| *state != IngestState::Waiting)
            .await
        {
            Ok(state) => state.clone(),
            // The task dropped its sender without reporting, which only
            // happens if it panicked.
            Err(_) => IngestState::Faulted("ingest task ended unexpectedly".to_owned()),
        }
    }

    /// Stops accepting datagrams and waits until the socket is released.
    pub async fn shutdown(mut self) -> IngestState {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!("ingest task did not exit cleanly: {}", err);
        }
        self.state()
    }
}
