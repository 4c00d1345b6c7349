//! TCP plumbing shared by clients and servers.
//!
//! A [`Link`] is the write side of one connection: callers queue encoded
//! payloads and a dedicated writer task frames and flushes them. The read side
//! is handed back as a `FramedRead` so each owner drives it from its own loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use twinlock_proto::{decode_message, encode_message, FrameCodec, FrameSink, LinkId, Message, RpcTable};

use crate::LockError;

/// Read half of a connection, yielding whole frame payloads.
pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Streaming,
    Closing,
}

/// True for 10/8, 172.16/12, 192.168/16 and 127/8.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(_) => false,
    }
}

pub fn ensure_private(addr: SocketAddr) -> Result<(), LockError> {
    if is_private(addr.ip()) {
        Ok(())
    } else {
        Err(LockError::NonPrivateAddress(addr))
    }
}

/// Open a TCP connection with Nagle disabled.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream, LockError> {
    ensure_private(addr)?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Write side of a connection.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Encode and queue one message with an optional trailing payload.
    pub fn send_message(&self, message: &Message, extra: Option<&[u8]>) -> Result<bool, LockError> {
        let payload = encode_message(message, extra)?;
        Ok(self.send_payload(payload))
    }

    /// Like `send_message`, but waits for queue space instead of refusing.
    /// False once the writer is gone.
    pub async fn send_message_waiting(&self, message: &Message) -> Result<bool, LockError> {
        let payload = encode_message(message, None)?;
        Ok(self.tx.send(payload).await.is_ok())
    }
}

impl FrameSink for Link {
    fn link_id(&self) -> LinkId {
        self.id
    }

    fn send_payload(&self, payload: Bytes) -> bool {
        self.tx.try_send(payload).is_ok()
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Aborts the wrapped task when dropped, so a connection's helpers die with
/// the task that owns the connection.
pub struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Split `stream` into a queued writer and a frame reader.
pub fn open_link(
    stream: TcpStream,
    id: LinkId,
    peer: SocketAddr,
    capacity: usize,
) -> (Arc<Link>, FrameReader, AbortOnDrop) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = AbortOnDrop::new(tokio::spawn(write_loop(write_half, rx, id)));
    let link = Arc::new(Link { id, peer, tx });
    (link, FramedRead::new(read_half, FrameCodec), writer)
}

async fn write_loop(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, id: LinkId) {
    let mut sink = FramedWrite::new(write_half, FrameCodec);
    while let Some(payload) = rx.recv().await {
        if let Err(err) = sink.feed(payload).await {
            tracing::debug!(link = id, error = %err, "link write failed");
            return;
        }
        // Drain what is already queued so one flush covers a burst.
        while let Ok(more) = rx.try_recv() {
            if let Err(err) = sink.feed(more).await {
                tracing::debug!(link = id, error = %err, "link write failed");
                return;
            }
        }
        if let Err(err) = sink.flush().await {
            tracing::debug!(link = id, error = %err, "link flush failed");
            return;
        }
    }
}

/// Route every incoming message to `rpc` until the peer closes the stream.
///
/// Corrupt input ends the loop with a protocol error; there is no attempt to
/// resynchronize on the next header key.
pub async fn read_replies(reader: &mut FrameReader, rpc: &RpcTable) -> Result<(), LockError> {
    while let Some(frame) = reader.next().await {
        let (message, payload) = decode_message(frame?)?;
        rpc.complete(message, payload);
    }
    Ok(())
}
