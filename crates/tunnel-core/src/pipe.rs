use std::{
    io::{ErrorKind, Read},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use tunnel_protocol::FrameType;

use crate::{
    error::TunnelError, link::ControlLink, queue::BoundedQueue, registry::VcRegistry,
    timeouts::READ_CHUNK,
};

/// Reports bytes moved by a pipe: `(up_bytes, down_bytes)` per call, not a
/// running total. Plain atomic increments upstream of this callback are
/// sufficient per spec; this crate leaves aggregation to the observer.
pub type TrafficSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// The reader+writer thread pair that forwards one virtual connection's peer
/// socket to the control link, per spec §4.5.
pub struct Pipe {
    done_reader: mpsc::Receiver<()>,
    done_writer: mpsc::Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl Pipe {
    /// Spawns the reader/writer pair for VC `id`. `peer` is read from; its
    /// registry handle (already inserted by the caller) is removed and
    /// closed by whichever side tears the VC down first. `closed` is the
    /// same flag the caller registered this VC's entry with, so an inbound
    /// CLOSE frame handled by the session's frame-dispatch loop and this
    /// pipe's own teardown agree on whether CLOSE has already been sent.
    pub fn spawn(
        id: u32,
        peer: TcpStream,
        link: ControlLink,
        registry: Arc<VcRegistry>,
        closed: Arc<AtomicBool>,
        queue_capacity: usize,
        read_timeout: Duration,
        put_timeout: Duration,
        traffic: Option<TrafficSink>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(queue_capacity));
        let (tx_reader, done_reader) = mpsc::channel();
        let (tx_writer, done_writer) = mpsc::channel();

        {
            let queue = Arc::clone(&queue);
            let link = link.clone();
            let registry = Arc::clone(&registry);
            let closed = Arc::clone(&closed);
            let traffic = traffic.clone();
            thread::Builder::new()
                .name(format!("vc-{id}-reader"))
                .spawn(move || {
                    reader_loop(
                        id,
                        peer,
                        &queue,
                        &link,
                        &registry,
                        &closed,
                        read_timeout,
                        put_timeout,
                        traffic.as_deref(),
                    );
                    let _ = tx_reader.send(());
                })
                .expect("failed to spawn vc reader thread");
        }

        {
            let registry = Arc::clone(&registry);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name(format!("vc-{id}-writer"))
                .spawn(move || {
                    writer_loop(id, &queue, &link, &registry, &closed, traffic.as_deref());
                    let _ = tx_writer.send(());
                })
                .expect("failed to spawn vc writer thread");
        }

        Self { done_reader, done_writer, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` total for both threads to finish. Returns
    /// `false` if either is still running when the deadline passes; the
    /// thread is left to finish on its own rather than blocked on forever
    /// (its socket has already been shut down by `teardown_once`, so this
    /// should only happen under pathological scheduling delay).
    pub fn join_within(self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let reader_done = self
            .done_reader
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_ok();
        let writer_done = self
            .done_writer
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_ok();
        reader_done && writer_done
    }
}

fn teardown_once(id: u32, link: &ControlLink, registry: &VcRegistry, closed: &AtomicBool) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = link.send(FrameType::Close, id, &[]);
    if let Some(entry) = registry.remove(id) {
        let _ = entry.socket.shutdown(Shutdown::Both);
    }
}

/// Logs a VC-scoped error at the level its scope warrants: a single virtual
/// connection misbehaving (`is_vc_scoped`) is expected background noise, the
/// session survives it, so it's logged at `debug`; anything else is `warn`.
pub(crate) fn log_vc_error(id: u32, err: TunnelError) {
    if err.is_vc_scoped() {
        debug!(vc = id, error = %err, "vc error, tearing down this connection only");
    } else {
        warn!(vc = id, error = %err, "vc error");
    }
}

#[allow(clippy::too_many_arguments)]
fn reader_loop(
    id: u32,
    mut peer: TcpStream,
    queue: &BoundedQueue,
    link: &ControlLink,
    registry: &VcRegistry,
    closed: &AtomicBool,
    read_timeout: Duration,
    put_timeout: Duration,
    traffic: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) {
    let _ = peer.set_read_timeout(Some(read_timeout));
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match peer.read(&mut buf) {
            Ok(0) => {
                debug!(vc = id, "peer closed, EOF");
                break;
            }
            Ok(n) => {
                if let Some(traffic) = traffic {
                    traffic(n as u64, 0);
                }
                if queue.push_timeout(buf[..n].to_vec(), put_timeout).is_err() {
                    log_vc_error(id, TunnelError::QueueOverflow);
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(err) => {
                log_vc_error(id, TunnelError::PeerIo(err));
                break;
            }
        }
    }

    queue.close();
    teardown_once(id, link, registry, closed);
}

fn writer_loop(
    id: u32,
    queue: &BoundedQueue,
    link: &ControlLink,
    registry: &VcRegistry,
    closed: &AtomicBool,
    traffic: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) {
    while let Some(chunk) = queue.pop() {
        if let Some(traffic) = traffic {
            traffic(0, chunk.len() as u64);
        }
        if link.send(FrameType::Data, id, &chunk).is_err() {
            break;
        }
    }
    teardown_once(id, link, registry, closed);
}
