//! TCP transport.
//!
//! Each worker opens one outbound connection to every peer and accepts the
//! inbound connections of all peers on its listener.
//! Frames are length delimited.
//! The first frame on each connection is a hello consisting of a magic
//! identifier, the protocol version, the id of the connecting worker and a
//! session id that is generated anew every time a worker starts.
//! A connection from a known worker carrying a different session id means
//! that the worker has restarted, which is reported as loss of its previous
//! incarnation.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    fmt,
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};
use uuid::Uuid;

use super::{Inbound, LinkEvent, Transport};
use crate::{Cfg, TransportError, WorkerId};

const MAGIC: &[u8; 4] = b"RREF";
const VERSION: u8 = 1;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// First frame sent on every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Hello {
    worker: WorkerId,
    session: Uuid,
}

impl Hello {
    fn write(&self) -> Bytes {
        let mut writer = BytesMut::new().writer();
        writer.write_all(MAGIC).expect("writing to memory cannot fail");
        writer.write_u8(VERSION).expect("writing to memory cannot fail");
        writer.write_u32::<LE>(self.worker).expect("writing to memory cannot fail");
        writer.write_all(self.session.as_bytes()).expect("writing to memory cannot fail");
        writer.into_inner().freeze()
    }

    fn read(mut buf: &[u8]) -> Result<Self, io::Error> {
        let mut magic = [0; 4];
        buf.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(ErrorKind::InvalidData, "invalid magic identifier"));
        }
        let version = buf.read_u8()?;
        if version != VERSION {
            return Err(io::Error::new(ErrorKind::InvalidData, format!("unsupported protocol version {}", version)));
        }
        let worker = buf.read_u32::<LE>()?;
        let mut session = [0; 16];
        buf.read_exact(&mut session)?;
        Ok(Self { worker, session: Uuid::from_bytes(session) })
    }
}

struct Shared {
    me: WorkerId,
    events: mpsc::UnboundedSender<LinkEvent>,
    sessions: Mutex<HashMap<WorkerId, Uuid>>,
    max_frame_length: usize,
    stop: CancellationToken,
}

impl Shared {
    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder().max_frame_length(self.max_frame_length).new_codec()
    }

    fn lost(&self, peer: WorkerId) {
        let _ = self.events.send(LinkEvent::PeerLost(peer));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, addr) = tokio::select! {
                () = self.stop.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(worker = self.me, %err, "accepting connection failed");
                        continue;
                    }
                },
            };
            tracing::debug!(worker = self.me, %addr, "accepted connection");
            tokio::spawn(self.clone().reader(socket, addr));
        }
    }

    async fn reader(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let mut framed = FramedRead::new(socket, self.codec());

        let hello = tokio::select! {
            () = self.stop.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => match Hello::read(&frame) {
                    Ok(hello) => hello,
                    Err(err) => {
                        tracing::warn!(worker = self.me, %addr, %err, "invalid hello");
                        return;
                    }
                },
                Some(Err(err)) => {
                    tracing::warn!(worker = self.me, %addr, %err, "receiving hello failed");
                    return;
                }
                None => return,
            },
        };
        let peer = hello.worker;

        let restarted = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.insert(peer, hello.session) {
                Some(previous) => previous != hello.session,
                None => false,
            }
        };
        if restarted {
            tracing::warn!(worker = self.me, peer, session = %hello.session, "worker has restarted");
            self.lost(peer);
        }

        loop {
            let frame = tokio::select! {
                () = self.stop.cancelled() => return,
                frame = framed.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if self.events.send(LinkEvent::Frame(peer, frame.freeze())).is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(worker = self.me, peer, %err, "receiving from worker failed");
                    break;
                }
                None => {
                    tracing::debug!(worker = self.me, peer, "worker closed connection");
                    break;
                }
            }
        }

        let current = self.sessions.lock().unwrap().get(&peer) == Some(&hello.session);
        if current {
            self.lost(peer);
        }
    }

    async fn connect(&self, peer: WorkerId, addr: SocketAddr, timeout: Duration) -> Result<TcpStream, io::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    socket.set_nodelay(true)?;
                    return Ok(socket);
                }
                Err(err) if Instant::now() + CONNECT_RETRY < deadline => {
                    tracing::trace!(worker = self.me, peer, %addr, %err, "connecting failed, retrying");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn writer(
        self: Arc<Self>, peer: WorkerId, addr: SocketAddr, session: Uuid, connect_timeout: Duration,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let socket = tokio::select! {
            () = self.stop.cancelled() => return,
            res = self.connect(peer, addr, connect_timeout) => match res {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(worker = self.me, peer, %addr, %err, "connecting to worker failed");
                    self.lost(peer);
                    return;
                }
            },
        };
        tracing::debug!(worker = self.me, peer, %addr, "connected");

        let mut framed = FramedWrite::new(socket, self.codec());
        if let Err(err) = framed.send(Hello { worker: self.me, session }.write()).await {
            tracing::warn!(worker = self.me, peer, %err, "sending hello failed");
            self.lost(peer);
            return;
        }

        while let Some(frame) = rx.recv().await {
            if let Err(err) = framed.send(frame).await {
                tracing::warn!(worker = self.me, peer, %err, "sending to worker failed");
                self.lost(peer);
                return;
            }
        }

        let _ = SinkExt::<Bytes>::close(&mut framed).await;
        tracing::debug!(worker = self.me, peer, "connection closed");
    }
}

/// Transport connecting workers over TCP.
pub struct TcpTransport {
    shared: Arc<Shared>,
    writers: Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Bytes>>>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpTransport").field("worker", &self.shared.me).finish()
    }
}

impl TcpTransport {
    /// Starts the transport for worker `me`, accepting connections on `listener`
    /// and connecting to the peers at the specified addresses.
    ///
    /// Connections are established in the background and retried until the
    /// [connect timeout](Cfg::connect_timeout) expires, after which the peer
    /// is reported as lost.
    /// An entry for `me` in `peers` is ignored; frames to the local worker are
    /// looped back.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(me: WorkerId, listener: TcpListener, peers: HashMap<WorkerId, SocketAddr>, cfg: &Cfg) -> (Self, Inbound) {
        let (events, inbound) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            me,
            events,
            sessions: Mutex::new(HashMap::new()),
            max_frame_length: cfg.max_frame_length,
            stop: CancellationToken::new(),
        });
        let session = Uuid::new_v4();
        tracing::debug!(worker = me, %session, "starting TCP transport");

        tokio::spawn(shared.clone().accept_loop(listener));

        let mut writers = HashMap::new();
        for (peer, addr) in peers.into_iter().filter(|(peer, _)| *peer != me) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(shared.clone().writer(peer, addr, session, cfg.connect_timeout, rx));
            writers.insert(peer, tx);
        }

        (Self { shared, writers: Mutex::new(writers) }, inbound)
    }
}

impl Transport for TcpTransport {
    fn send(&self, dst: WorkerId, frame: Bytes) -> Result<(), TransportError> {
        if self.shared.stop.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if dst == self.shared.me {
            return self.shared.events.send(LinkEvent::Frame(dst, frame)).map_err(|_| TransportError::Closed);
        }
        let writers = self.writers.lock().unwrap();
        let tx = writers.get(&dst).ok_or(TransportError::Unreachable(dst))?;
        tx.send(frame).map_err(|_| TransportError::Unreachable(dst))
    }

    fn close(&self) {
        self.shared.stop.cancel();
        self.writers.lock().unwrap().clear();
    }
}
