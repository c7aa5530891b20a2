//! Chunked file transfer with backpressure
//!
//! Files are announced with a `file` message on the reliable channel, then
//! streamed as fixed-size chunks on the unordered channel. One file is in
//! flight per peer; further files wait in a FIFO queue. Receivers buffer
//! chunks by file id in any arrival order and assemble once all of them are
//! present.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::chunk::{chunk_count, create_chunk, parse_chunk};
use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::types::{short_id, ChannelKind, Direction, Frame};

pub const FILE: &str = "file";

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Announcement sent before the chunks of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub chunks: u64,
}

/// Header of one binary chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub file_id: String,
    pub chunk_id: u64,
}

/// A file queued for sending
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutgoingFile {
    pub fn from_bytes(name: &str, mime_type: &str, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }

    pub fn from_reader(
        name: &str,
        mime_type: &str,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            reader: Box::new(reader),
        }
    }

    /// Stream a file from disk
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_reader(&name, DEFAULT_MIME_TYPE, size, file))
    }

    /// Fill `buf` unless the source ends first
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Bytes,
}

struct ReceiveSession {
    metadata: FileMetadata,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_bytes: u64,
    started_at: Instant,
    progress: u8,
}

/// Tracks progress and reports only whole-percent changes
struct ProgressMeter {
    started_at: Instant,
    total: u64,
    last: Option<u8>,
}

impl ProgressMeter {
    fn new(total: u64) -> Self {
        Self {
            started_at: Instant::now(),
            total,
            last: None,
        }
    }

    /// `Some((percent, bits per second))` when the whole percent changed
    fn update(&mut self, done: u64) -> Option<(u8, f64)> {
        let percent = percent(done, self.total);
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some((percent, bitrate(done, self.started_at)))
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

fn bitrate(bytes: u64, since: Instant) -> f64 {
    let secs = since.elapsed().as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}

pub struct FileTransferMiddleware {
    ctx: Arc<PeerContext>,
    queue: Mutex<VecDeque<(String, OutgoingFile)>>,
    sending: AtomicBool,
    sessions: Mutex<HashMap<String, ReceiveSession>>,
}

impl FileTransferMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self {
            ctx,
            queue: Mutex::new(VecDeque::new()),
            sending: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a file; returns its id. Transfers run one at a time in FIFO order.
    pub async fn send_file(self: &Arc<Self>, file: OutgoingFile) -> String {
        let file_id = Uuid::new_v4().to_string();
        self.queue.lock().await.push_back((file_id.clone(), file));
        if !self.sending.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.clone().drain_queue());
        }
        file_id
    }

    pub async fn pending_receives(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn drain_queue(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().await.pop_front();
            let Some((file_id, file)) = next else {
                self.sending.store(false, Ordering::SeqCst);
                // a file queued after the pop but before the flag dropped
                if self.queue.lock().await.is_empty() || self.sending.swap(true, Ordering::SeqCst)
                {
                    return;
                }
                continue;
            };

            let name = file.name.clone();
            if let Err(e) = self.transmit(&file_id, file).await {
                warn!(
                    "Sending {} to {} failed: {}",
                    name,
                    short_id(&self.ctx.target_peer_id),
                    e
                );
            }
        }
    }

    async fn transmit(&self, file_id: &str, mut file: OutgoingFile) -> Result<(), MeshError> {
        let chunk_config = &self.ctx.config.chunk;
        let data_size = chunk_config.data_chunk_size();
        let chunks = chunk_count(file.size, data_size);

        let metadata = FileMetadata {
            file_id: file_id.to_string(),
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.mime_type.clone(),
            chunks,
        };
        info!(
            "Sending {} ({} bytes, {} chunks) to {}",
            metadata.file_name,
            metadata.file_size,
            chunks,
            short_id(&self.ctx.target_peer_id)
        );
        self.ctx
            .send_message(ChannelKind::Reliable, FILE, serde_json::to_value(&metadata)?)
            .await?;

        let channel = self.ctx.channel(ChannelKind::Unordered)?.clone();
        let mut meter = ProgressMeter::new(file.size);
        let mut buf = vec![0u8; data_size];
        let mut sent = 0u64;

        for chunk_id in 0..chunks {
            let len = file.read_chunk(&mut buf).await?;
            if len == 0 {
                return Err(MeshError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} ended after {} bytes", file.name, sent),
                )));
            }
            let header = ChunkMetadata {
                file_id: file_id.to_string(),
                chunk_id,
            };
            let frame = create_chunk(&buf[..len], &header, data_size, chunk_config.metadata_size)?;
            channel.send(Frame::Binary(Bytes::from(frame))).await?;
            sent += len as u64;

            channel.wait_buffered_amount_low().await;

            if let Some((progress, bitrate)) = meter.update(sent) {
                self.ctx.emit(MeshEvent::FileProgress {
                    peer_id: self.ctx.target_peer_id.clone(),
                    file_id: file_id.to_string(),
                    direction: Direction::Outgoing,
                    progress,
                    bitrate,
                });
            }
        }

        debug!(
            "Sent {} to {}",
            metadata.file_name,
            short_id(&self.ctx.target_peer_id)
        );
        self.ctx.emit(MeshEvent::FileSent {
            peer_id: self.ctx.target_peer_id.clone(),
            file_id: file_id.to_string(),
        });
        Ok(())
    }

    async fn on_metadata(&self, data: &serde_json::Value) {
        let metadata: FileMetadata = match serde_json::from_value(data.clone()) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    "Invalid file metadata from {}: {}",
                    short_id(&self.ctx.target_peer_id),
                    e
                );
                return;
            }
        };

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&metadata.file_id) {
            debug!("Duplicate announcement of {}", metadata.file_id);
            return;
        }
        info!(
            "Receiving {} ({} bytes) from {}",
            metadata.file_name,
            metadata.file_size,
            short_id(&self.ctx.target_peer_id)
        );
        let file_id = metadata.file_id.clone();
        let empty = metadata.chunks == 0;
        sessions.insert(
            file_id.clone(),
            ReceiveSession {
                metadata,
                chunks: BTreeMap::new(),
                received_bytes: 0,
                started_at: Instant::now(),
                progress: 0,
            },
        );
        if empty {
            if let Some(session) = sessions.remove(&file_id) {
                drop(sessions);
                self.complete(session);
            }
        }
    }

    async fn on_chunk(&self, frame: &[u8]) {
        let chunk_config = &self.ctx.config.chunk;
        let chunk = match parse_chunk::<ChunkMetadata>(
            frame,
            chunk_config.whole_size,
            chunk_config.metadata_size,
        ) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    "Invalid chunk from {}: {}",
                    short_id(&self.ctx.target_peer_id),
                    e
                );
                return;
            }
        };
        let ChunkMetadata { file_id, chunk_id } = chunk.metadata;

        let mut sessions = self.sessions.lock().await;
        // session not yet announced or already assembled
        let Some(session) = sessions.get_mut(&file_id) else {
            debug!(
                "Dropping chunk {} of unknown file {} from {}",
                chunk_id,
                file_id,
                short_id(&self.ctx.target_peer_id)
            );
            return;
        };
        if chunk_id >= session.metadata.chunks {
            warn!("Chunk {} out of range for {}", chunk_id, file_id);
            return;
        }

        let len = chunk.payload.len() as u64;
        if session.chunks.insert(chunk_id, chunk.payload).is_none() {
            session.received_bytes += len;
        }

        let progress = percent(session.received_bytes, session.metadata.file_size);
        if progress != session.progress {
            session.progress = progress;
            self.ctx.emit(MeshEvent::FileProgress {
                peer_id: self.ctx.target_peer_id.clone(),
                file_id: file_id.clone(),
                direction: Direction::Incoming,
                progress,
                bitrate: bitrate(session.received_bytes, session.started_at),
            });
        }

        if session.chunks.len() as u64 == session.metadata.chunks {
            if let Some(session) = sessions.remove(&file_id) {
                drop(sessions);
                self.complete(session);
            }
        }
    }

    fn complete(&self, session: ReceiveSession) {
        // BTreeMap iterates in chunk id order
        let mut data = Vec::with_capacity(session.received_bytes as usize);
        for chunk in session.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        let metadata = session.metadata;
        if data.len() as u64 != metadata.file_size {
            warn!(
                "File {} from {} assembled to {} bytes, expected {}",
                metadata.file_id,
                short_id(&self.ctx.target_peer_id),
                data.len(),
                metadata.file_size
            );
        }
        info!(
            "Received {} from {}",
            metadata.file_name,
            short_id(&self.ctx.target_peer_id)
        );

        self.ctx.emit(MeshEvent::FileReceived {
            from: self.ctx.target_peer_id.clone(),
            file: ReceivedFile {
                file_id: metadata.file_id,
                name: metadata.file_name,
                mime_type: metadata.file_type,
                size: data.len() as u64,
                data: Bytes::from(data),
            },
        });
    }
}

#[async_trait]
impl Middleware for FileTransferMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::FileTransfer
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        match incoming {
            Incoming::Message { envelope, .. } if envelope.kind == FILE => {
                self.on_metadata(&envelope.data).await;
                false
            }
            Incoming::Binary {
                channel: ChannelKind::Unordered,
                data,
            } => {
                self.on_chunk(data).await;
                false
            }
            _ => true,
        }
    }
}
