//! Communication server (spec.md §4.4): owns every send/receive channel and
//! multiplexes them on a single dedicated OS thread running a current-thread
//! `tokio` runtime — one thread owns the async reactor, the rest of the
//! node talks to it over channels, with a single per-peer `TcpStream` pair
//! instead of a gossip overlay, since GMT's membership is static.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::buffer::BufferPool;
use super::transport::{connect_mesh, recv_frame, send_frame};
use crate::config::Config;
use crate::error::{GmtError, Result};

/// A buffer ready to go out to `dest`.
pub struct Outbound {
    pub dest: u32,
    pub bytes: Vec<u8>,
}

/// A buffer that just arrived from `source`, handed to the helper that owns
/// this receive channel.
pub struct Inbound {
    pub source: u32,
    pub bytes: Vec<u8>,
}

/// Handle the rest of the node uses to talk to the comm-server thread.
pub struct CommHandle {
    pub outbound_tx: mpsc::Sender<Outbound>,
    pub inbound_rx: spin::Mutex<mpsc::Receiver<Inbound>>,
    pub buffers: Arc<BufferPool>,
}

impl CommHandle {
    /// Non-blocking per spec.md §4.4 step (1): posting a send never blocks
    /// the caller on network I/O, only on this bounded channel having room
    /// (which in a correctly-sized deployment it always does, since the
    /// aggregation layer already throttles by `COMM_BUFFER_SIZE`).
    pub fn try_send(&self, dest: u32, bytes: Vec<u8>) -> Result<()> {
        self.outbound_tx
            .try_send(Outbound { dest, bytes })
            .map_err(|_| GmtError::Network("outbound channel full".into()))
    }

    pub fn try_recv(&self) -> Option<Inbound> {
        self.inbound_rx.lock().try_recv().ok()
    }
}

/// Spawn the comm-server thread and return a handle to it. Blocks the
/// calling thread only long enough to establish the mesh (spec.md §4.4
/// steps run on the dedicated thread from then on).
pub fn spawn(cfg: Arc<Config>) -> Result<Arc<CommHandle>> {
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(cfg.num_buffs_per_channel as usize * 4);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(cfg.num_buffs_per_channel as usize * 4);
    let buffers = Arc::new(BufferPool::new(cfg.num_cmd_blocks as usize * 2, cfg.comm_buffer_size));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
    let thread_cfg = Arc::clone(&cfg);
    std::thread::Builder::new()
        .name("gmt-comm-server".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(GmtError::Network(e.to_string())));
                    return;
                }
            };
            rt.block_on(run(thread_cfg, outbound_rx, inbound_tx, ready_tx));
        })
        .map_err(|e| GmtError::Network(format!("spawn comm-server thread: {e}")))?;

    ready_rx
        .recv()
        .map_err(|_| GmtError::Network("comm-server thread exited before signalling ready".into()))??;

    Ok(Arc::new(CommHandle {
        outbound_tx,
        inbound_rx: spin::Mutex::new(inbound_rx),
        buffers,
    }))
}

async fn run(
    cfg: Arc<Config>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Inbound>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let streams = match connect_mesh(cfg.node_id, &cfg.addresses).await {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Fan the single outbound channel out to one per-peer task by rank, and
    // one receive task per peer — this is step (1)/(3) of spec.md §4.4;
    // steps (2)/(4) (poll completions) are implicit in `tokio`'s own
    // readiness-driven I/O rather than a manual completion-polling loop.
    let mut per_peer_tx = Vec::new();
    let mut tasks = Vec::new();
    for (peer, stream) in streams.into_iter().enumerate() {
        let Some(stream) = stream else {
            per_peer_tx.push(None);
            continue;
        };
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(cfg.num_buffs_per_channel as usize);
        per_peer_tx.push(Some(tx));

        let peer_u32 = peer as u32;
        tasks.push(tokio::spawn(send_loop(write_half, rx)));
        tasks.push(tokio::spawn(recv_loop(read_half, peer_u32, inbound_tx.clone())));
    }

    let _ = ready_tx.send(Ok(()));

    while let Some(out) = outbound_rx.recv().await {
        if let Some(Some(tx)) = per_peer_tx.get(out.dest as usize) {
            let _ = tx.send(out.bytes).await;
        }
    }

    for t in tasks {
        t.abort();
    }
}

async fn send_loop(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        // A TCP half doesn't expose `send_frame`'s `&mut TcpStream`
        // signature directly; reuse the same length-prefix framing inline.
        use tokio::io::AsyncWriteExt;
        if write_half.write_all(&(bytes.len() as u32).to_le_bytes()).await.is_err() {
            return;
        }
        if write_half.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

async fn recv_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, source: u32, inbound_tx: mpsc::Sender<Inbound>) {
    use tokio::io::AsyncReadExt;
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if read_half.read_exact(&mut buf).await.is_err() {
            return;
        }
        if inbound_tx.send(Inbound { source, bytes: buf }).await.is_err() {
            return;
        }
    }
}

// Re-exported so callers that want a single point-to-point frame (e.g. the
// reservation-request fast path, which doesn't go through aggregation) can
// reuse the framing helpers without standing up the full mesh.
pub use super::transport::{recv_frame as recv_one_frame, send_frame as send_one_frame};
