//! Point-to-point message transport between ranks
//!
//! Rank 0 is the coordinator; ranks `1..size` are workers. Links exist only
//! between the coordinator and each worker, never between workers. Every
//! link is FIFO per direction and `send`/`recv` are awaited, so a rank
//! blocks until its peer makes progress.
//!
//! - [`LocalTransport`]: all ranks in one process, bounded tokio mpsc links
//! - [`TcpTransport`]: one rank per process, length-prefixed frames over TCP

use crate::error::{Result, TrafficError};
use crate::retry::RetryPolicy;
use crate::wire::{WireMessage, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// Position of a process in the group
pub type Rank = usize;

/// Rank of the coordinator
pub const COORDINATOR: Rank = 0;

/// Blocking point-to-point messaging seen from one rank
#[async_trait]
pub trait Transport: Send + Sync {
    /// This endpoint's rank
    fn rank(&self) -> Rank;

    /// Ranks this endpoint has a link to, ascending
    fn peers(&self) -> Vec<Rank>;

    /// Send one message to `to`
    async fn send(&self, to: Rank, message: &WireMessage) -> Result<()>;

    /// Receive the next message from `from`
    async fn recv(&self, from: Rank) -> Result<WireMessage>;
}

fn no_link(from: Rank, to: Rank) -> TrafficError {
    TrafficError::Transport(format!("no link between rank {} and rank {}", from, to))
}

/// In-process endpoint backed by bounded mpsc channels
pub struct LocalTransport {
    rank: Rank,
    outgoing: BTreeMap<Rank, mpsc::Sender<Bytes>>,
    incoming: BTreeMap<Rank, Mutex<mpsc::Receiver<Bytes>>>,
}

impl LocalTransport {
    /// Build `size` connected endpoints, index `i` having rank `i`.
    ///
    /// Each direction of each link buffers up to `link_capacity` frames.
    pub fn group(size: usize, link_capacity: usize) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(TrafficError::ConfigError(
                "a process group needs at least one rank".to_string(),
            ));
        }
        if link_capacity == 0 {
            return Err(TrafficError::ConfigError(
                "link_capacity must be positive".to_string(),
            ));
        }

        let mut endpoints: Vec<Self> = (0..size)
            .map(|rank| Self {
                rank,
                outgoing: BTreeMap::new(),
                incoming: BTreeMap::new(),
            })
            .collect();

        for worker in 1..size {
            let (down_tx, down_rx) = mpsc::channel(link_capacity);
            let (up_tx, up_rx) = mpsc::channel(link_capacity);
            endpoints[COORDINATOR].outgoing.insert(worker, down_tx);
            endpoints[COORDINATOR]
                .incoming
                .insert(worker, Mutex::new(up_rx));
            endpoints[worker].outgoing.insert(COORDINATOR, up_tx);
            endpoints[worker]
                .incoming
                .insert(COORDINATOR, Mutex::new(down_rx));
        }

        tracing::debug!(size, link_capacity, "local process group created");
        Ok(endpoints)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn peers(&self) -> Vec<Rank> {
        self.outgoing.keys().copied().collect()
    }

    async fn send(&self, to: Rank, message: &WireMessage) -> Result<()> {
        let link = self
            .outgoing
            .get(&to)
            .ok_or_else(|| no_link(self.rank, to))?;
        let body = message.encode()?;
        tracing::trace!(from = self.rank, to, kind = %message.kind(), bytes = body.len(), "send");
        link.send(body)
            .await
            .map_err(|_| TrafficError::Transport(format!("rank {} hung up", to)))
    }

    async fn recv(&self, from: Rank) -> Result<WireMessage> {
        let link = self
            .incoming
            .get(&from)
            .ok_or_else(|| no_link(self.rank, from))?;
        let body = link.lock().await.recv().await.ok_or_else(|| {
            TrafficError::Transport(format!("rank {} closed its link", from))
        })?;
        let message = WireMessage::decode(body)?;
        tracing::trace!(from, to = self.rank, kind = %message.kind(), "recv");
        Ok(message)
    }
}

struct Peer {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    addr: SocketAddr,
}

impl Peer {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            addr,
        }
    }
}

/// Endpoint speaking length-prefixed frames over TCP
pub struct TcpTransport {
    rank: Rank,
    peers: BTreeMap<Rank, Peer>,
}

impl TcpTransport {
    /// Bind `addr` and wait for every worker of a `total_processes` group
    pub async fn listen(addr: &str, total_processes: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::accept_workers(listener, total_processes).await
    }

    /// Accept exactly `total_processes - 1` workers on `listener`.
    ///
    /// Each worker must open with HELLO carrying a distinct rank in
    /// `1..total_processes`; anything else aborts the startup.
    pub async fn accept_workers(listener: TcpListener, total_processes: usize) -> Result<Self> {
        if total_processes < 2 {
            return Err(TrafficError::ConfigError(format!(
                "distributed mode needs at least 2 processes, got {}",
                total_processes
            )));
        }

        tracing::info!(
            addr = %listener.local_addr()?,
            workers = total_processes - 1,
            "waiting for workers"
        );

        let mut peers = BTreeMap::new();
        while peers.len() < total_processes - 1 {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let peer = Peer::new(stream, addr);

            let hello = {
                let mut reader = peer.reader.lock().await;
                WireMessage::decode(read_frame(&mut *reader).await?)?
            };
            let rank = match hello {
                WireMessage::Hello { rank } => rank as Rank,
                other => {
                    return Err(TrafficError::Protocol(format!(
                        "expected HELLO from {}, got {}",
                        addr,
                        other.kind()
                    )))
                }
            };
            if rank == COORDINATOR || rank >= total_processes {
                return Err(TrafficError::Protocol(format!(
                    "worker at {} announced rank {} outside 1..{}",
                    addr, rank, total_processes
                )));
            }
            if peers.contains_key(&rank) {
                return Err(TrafficError::Protocol(format!(
                    "rank {} announced twice (second from {})",
                    rank, addr
                )));
            }

            {
                let mut writer = peer.writer.lock().await;
                let ack = WireMessage::Hello {
                    rank: COORDINATOR as u32,
                };
                write_frame(&mut *writer, &ack.encode()?).await?;
            }
            tracing::info!(rank, peer = %addr, "worker joined");
            peers.insert(rank, peer);
        }

        Ok(Self {
            rank: COORDINATOR,
            peers,
        })
    }

    /// Connect to the coordinator at `addr` as worker `rank`
    pub async fn connect(addr: &str, rank: Rank, retry: &RetryPolicy) -> Result<Self> {
        if rank == COORDINATOR {
            return Err(TrafficError::ConfigError(
                "workers must have a rank of at least 1".to_string(),
            ));
        }
        let hello_rank = u32::try_from(rank)
            .map_err(|_| TrafficError::ConfigError(format!("rank {} too large", rank)))?;

        let stream = retry
            .run("connect to coordinator", || async move {
                TcpStream::connect(addr).await.map_err(TrafficError::from)
            })
            .await?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let peer = Peer::new(stream, remote);

        {
            let mut writer = peer.writer.lock().await;
            let hello = WireMessage::Hello { rank: hello_rank };
            write_frame(&mut *writer, &hello.encode()?).await?;
        }
        let ack = {
            let mut reader = peer.reader.lock().await;
            WireMessage::decode(read_frame(&mut *reader).await?)?
        };
        if ack != (WireMessage::Hello { rank: 0 }) {
            return Err(TrafficError::Protocol(format!(
                "expected HELLO from the coordinator, got {}",
                ack.kind()
            )));
        }

        tracing::info!(rank, coordinator = %remote, "joined process group");
        Ok(Self {
            rank,
            peers: BTreeMap::from([(COORDINATOR, peer)]),
        })
    }

    fn peer(&self, rank: Rank) -> Result<&Peer> {
        self.peers.get(&rank).ok_or_else(|| no_link(self.rank, rank))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn peers(&self) -> Vec<Rank> {
        self.peers.keys().copied().collect()
    }

    async fn send(&self, to: Rank, message: &WireMessage) -> Result<()> {
        let peer = self.peer(to)?;
        let body = message.encode()?;
        tracing::trace!(from = self.rank, to, kind = %message.kind(), peer = %peer.addr, "send");
        let mut writer = peer.writer.lock().await;
        write_frame(&mut *writer, &body).await
    }

    async fn recv(&self, from: Rank) -> Result<WireMessage> {
        let peer = self.peer(from)?;
        let body = {
            let mut reader = peer.reader.lock().await;
            read_frame(&mut *reader).await?
        };
        let message = WireMessage::decode(body)?;
        tracing::trace!(from, to = self.rank, kind = %message.kind(), "recv");
        Ok(message)
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(TrafficError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TrafficError::Protocol(format!(
            "announced frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(body.freeze())
}
