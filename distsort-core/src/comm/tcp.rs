//! One-worker-per-process transport over a full TCP mesh.
//!
//! Rank `r` dials every lower rank and accepts a connection from every higher
//! rank, so each pair shares exactly one stream. A reader task per stream
//! demultiplexes incoming frames into inboxes keyed by communicator context and
//! source; sub-communicators reuse the same streams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{AbortNotice, Communicator, Frame, Tag, check_peer, child_context, gather_split};
use crate::codec::BINCODE_CONFIG;
use crate::config::TcpConfig;
use crate::error::CommError;

const MAX_FRAME_BYTES: u32 = 1 << 31;

#[derive(Serialize, Deserialize)]
enum WireMessage {
    Hello {
        rank: u64,
    },
    Data {
        context: String,
        tag: Tag,
        payload: Vec<u8>,
    },
    Abort {
        rank: u64,
        reason: String,
    },
}

/// Length prefix for a frame of `bytes` bytes.
fn frame_len(bytes: usize) -> Result<u32, CommError> {
    u32::try_from(bytes)
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or(CommError::FrameTooLarge {
            bytes,
            limit: MAX_FRAME_BYTES as usize,
        })
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<(), CommError> {
    let bytes = bincode::serde::encode_to_vec(message, BINCODE_CONFIG)?;
    writer.write_u32_le(frame_len(bytes.len())?).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage, CommError> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(CommError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    let (message, _) = bincode::serde::decode_from_slice(&bytes, BINCODE_CONFIG)?;
    Ok(message)
}

struct Inbox {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

#[derive(Default)]
struct Inboxes {
    map: HashMap<(String, usize), Inbox>,
    closed: HashSet<usize>,
}

/// State shared between the mesh handle and its reader tasks.
struct Shared {
    inboxes: Mutex<Inboxes>,
    abort: watch::Sender<Option<AbortNotice>>,
    _abort_rx: watch::Receiver<Option<AbortNotice>>,
}

impl Shared {
    fn new() -> Self {
        let (abort, abort_rx) = watch::channel(None);
        Shared {
            inboxes: Mutex::new(Inboxes::default()),
            abort,
            _abort_rx: abort_rx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inboxes> {
        self.inboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inbox_rx(
        &self,
        context: &str,
        src: usize,
    ) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>> {
        let mut inboxes = self.lock();
        let closed = inboxes.closed.contains(&src);
        let inbox = inboxes
            .map
            .entry((context.to_string(), src))
            .or_insert_with(|| new_inbox(closed));
        Arc::clone(&inbox.rx)
    }

    fn deliver(&self, context: String, src: usize, frame: Frame) {
        let mut inboxes = self.lock();
        let closed = inboxes.closed.contains(&src);
        let inbox = inboxes
            .map
            .entry((context, src))
            .or_insert_with(|| new_inbox(closed));
        if let Some(tx) = &inbox.tx {
            let _ = tx.send(frame);
        }
    }

    /// Frames already delivered stay readable; anything further from `src`
    /// reports `Disconnected`.
    fn close_peer(&self, src: usize) {
        let mut inboxes = self.lock();
        inboxes.closed.insert(src);
        for ((_, from), inbox) in inboxes.map.iter_mut() {
            if *from == src {
                inbox.tx = None;
            }
        }
    }

    /// Forgets every inbox of `context`; frames still queued there are dropped.
    fn release(&self, context: &str) {
        self.lock().map.retain(|(c, _), _| c != context);
    }

    fn raise(&self, rank: usize, reason: &str) {
        self.abort.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(AbortNotice {
                rank,
                reason: reason.to_string(),
            });
            true
        });
    }
}

fn new_inbox(closed: bool) -> Inbox {
    let (tx, rx) = mpsc::unbounded_channel();
    Inbox {
        tx: if closed { None } else { Some(tx) },
        rx: Arc::new(tokio::sync::Mutex::new(rx)),
    }
}

async fn read_loop(shared: Arc<Shared>, src: usize, mut reader: OwnedReadHalf) {
    loop {
        match read_message(&mut reader).await {
            Ok(WireMessage::Data {
                context,
                tag,
                payload,
            }) => shared.deliver(context, src, Frame { tag, payload }),
            Ok(WireMessage::Abort { rank, reason }) => {
                warn!("[TcpMesh] Rank {} aborted the sort: {}", rank, reason);
                shared.raise(rank as usize, &reason);
            }
            Ok(WireMessage::Hello { rank }) => {
                warn!("[TcpMesh] Unexpected hello from rank {} on an open stream", rank);
            }
            Err(e) => {
                debug!("[TcpMesh] Stream from rank {} closed: {}", src, e);
                break;
            }
        }
    }
    shared.close_peer(src);
}

async fn dial(addr: &str, config: &TcpConfig) -> Result<TcpStream, CommError> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if attempt < config.connect_retries => {
                warn!(
                    "[TcpMesh] Dial {} attempt {} failed: {}. Retrying...",
                    addr,
                    attempt + 1,
                    e
                );
                sleep(config.retry_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(CommError::Connect(format!("{}: {}", addr, e))),
        }
    }
}

/// Established connections of one process to every other process.
pub struct TcpMesh {
    rank: usize,
    size: usize,
    writers: Vec<Option<tokio::sync::Mutex<OwnedWriteHalf>>>,
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpMesh {
    /// Binds `config.peers[rank]` and joins the mesh.
    pub async fn connect(rank: usize, config: &TcpConfig) -> Result<Arc<Self>, CommError> {
        let addr = config.peers.get(rank).ok_or(CommError::RankOutOfRange {
            rank,
            size: config.peers.len(),
        })?;
        let listener = TcpListener::bind(addr).await?;
        Self::with_listener(rank, listener, config).await
    }

    /// Joins the mesh using an already-bound listener, e.g. one bound to port 0.
    pub async fn with_listener(
        rank: usize,
        listener: TcpListener,
        config: &TcpConfig,
    ) -> Result<Arc<Self>, CommError> {
        let size = config.peers.len();
        check_peer(rank, size)?;
        let expected = size - rank - 1;
        let accept = tokio::spawn(async move {
            let mut accepted = Vec::with_capacity(expected);
            while accepted.len() < expected {
                let (mut stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                match read_message(&mut stream).await? {
                    WireMessage::Hello { rank: peer } => accepted.push((peer as usize, stream)),
                    _ => return Err(CommError::Connect("peer skipped the hello".into())),
                }
            }
            Ok::<_, CommError>(accepted)
        });

        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        for peer in 0..rank {
            let mut stream = dial(&config.peers[peer], config).await?;
            write_message(&mut stream, &WireMessage::Hello { rank: rank as u64 }).await?;
            streams[peer] = Some(stream);
        }
        let accepted = accept
            .await
            .map_err(|e| CommError::Connect(format!("accept task failed: {}", e)))??;
        for (peer, stream) in accepted {
            if peer <= rank || peer >= size || streams[peer].is_some() {
                return Err(CommError::Connect(format!(
                    "unexpected hello from rank {} at rank {}",
                    peer, rank
                )));
            }
            streams[peer] = Some(stream);
        }

        let shared = Arc::new(Shared::new());
        let mut writers = Vec::with_capacity(size);
        let mut readers = Vec::with_capacity(size.saturating_sub(1));
        for (peer, stream) in streams.into_iter().enumerate() {
            match stream {
                Some(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    readers.push(tokio::spawn(read_loop(Arc::clone(&shared), peer, read_half)));
                    writers.push(Some(tokio::sync::Mutex::new(write_half)));
                }
                None => writers.push(None),
            }
        }
        info!("[TcpMesh] Rank {} connected to {} peers", rank, size - 1);
        Ok(Arc::new(TcpMesh {
            rank,
            size,
            writers,
            shared,
            readers,
        }))
    }

    /// World communicator over this mesh.
    pub fn world(self: &Arc<Self>) -> TcpCommunicator {
        TcpCommunicator {
            mesh: Arc::clone(self),
            context: "world".to_string(),
            members: Arc::new((0..self.size).collect()),
            rank: self.rank,
            splits: AtomicU64::new(0),
            owns_context: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    async fn send_to(&self, world_dest: usize, message: &WireMessage) -> Result<(), CommError> {
        let writer = self.writers[world_dest]
            .as_ref()
            .ok_or(CommError::Disconnected {
                partner: world_dest,
            })?;
        let mut writer = writer.lock().await;
        write_message(&mut *writer, message)
            .await
            .map_err(|e| match e {
                CommError::Io(_) => CommError::Disconnected {
                    partner: world_dest,
                },
                other => other,
            })
    }
}

impl Drop for TcpMesh {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Handle on a [`TcpMesh`] group.
pub struct TcpCommunicator {
    mesh: Arc<TcpMesh>,
    context: String,
    members: Arc<Vec<usize>>,
    rank: usize,
    splits: AtomicU64,
    owns_context: bool,
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        if self.owns_context {
            self.mesh.shared.release(&self.context);
        }
    }
}

#[async_trait]
impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    async fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), CommError> {
        check_peer(dest, self.size())?;
        let pending = self.mesh.shared.abort.borrow().clone();
        if let Some(notice) = pending {
            return Err(notice.into());
        }
        let world_dest = self.members[dest];
        if world_dest == self.mesh.rank {
            self.mesh
                .shared
                .deliver(self.context.clone(), world_dest, Frame { tag, payload });
            return Ok(());
        }
        let message = WireMessage::Data {
            context: self.context.clone(),
            tag,
            payload,
        };
        self.mesh.send_to(world_dest, &message).await
    }

    async fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        check_peer(src, self.size())?;
        let rx = self.mesh.shared.inbox_rx(&self.context, self.members[src]);
        let mut abort = self.mesh.shared.abort.subscribe();
        let aborted = async move {
            match abort.wait_for(|notice| notice.is_some()).await {
                Ok(notice) => (*notice).clone(),
                Err(_) => None,
            }
        };
        let mut rx = rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame.accept(src, tag),
                None => Err(CommError::Disconnected { partner: src }),
            },
            notice = aborted => match notice {
                Some(notice) => Err(notice.into()),
                None => Err(CommError::Disconnected { partner: src }),
            },
        }
    }

    async fn split(
        &self,
        color: u32,
        key: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, CommError> {
        let seq = self.splits.fetch_add(1, Ordering::SeqCst);
        let parent_ranks = gather_split(self, seq, color, key, timeout).await?;
        let rank = parent_ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| CommError::InconsistentSplit("caller missing from its own colour".into()))?;
        let members: Vec<usize> = parent_ranks.iter().map(|&r| self.members[r]).collect();
        Ok(TcpCommunicator {
            mesh: Arc::clone(&self.mesh),
            context: child_context(&self.context, seq, color),
            members: Arc::new(members),
            rank,
            splits: AtomicU64::new(0),
            owns_context: true,
        })
    }

    async fn abort(&self, reason: &str) {
        let me = self.mesh.rank;
        self.mesh.shared.raise(me, reason);
        let message = WireMessage::Abort {
            rank: me as u64,
            reason: reason.to_string(),
        };
        for peer in (0..self.mesh.size).filter(|&p| p != me) {
            if let Err(e) = self.mesh.send_to(peer, &message).await {
                debug!("[TcpMesh] Could not forward abort to rank {}: {}", peer, e);
            }
        }
    }
}
