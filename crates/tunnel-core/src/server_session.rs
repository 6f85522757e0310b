use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, info, warn};
use tunnel_protocol::{Frame, FrameType, MAX_CONNECTION_ID, unpack};

use crate::{
    allocator::PortAllocator,
    auth::{AuthAttempt, CredentialVerifier, parse_auth_line},
    error::TunnelError,
    link::ControlLink,
    pipe::{Pipe, log_vc_error},
    registry::VcRegistry,
    timeouts::{MAX_AUTH_BYTES, Timeouts},
};

/// State shared by every session a server hosts: the credential verifier,
/// the port allocator and the tunable timeouts. One `ServerShared` backs
/// the whole listener; sessions are otherwise independent.
pub struct ServerShared {
    pub verifier: Arc<dyn CredentialVerifier>,
    pub allocator: Arc<PortAllocator>,
    pub timeouts: Timeouts,
    pub bind_host: String,
    pub vc_queue_size: usize,
    /// Flipped by the caller (e.g. a `ctrlc` handler) to ask every in-flight
    /// session, and the accept loop itself, to wind down instead of hanging
    /// forever. Sessions that exit for this reason return
    /// [`TunnelError::Cancelled`] rather than being reported as failures.
    pub stop: Arc<AtomicBool>,
}

/// Accepts control-link connections on `listener` and spawns one thread per
/// session, until `shared.stop` is set.
pub fn serve(listener: TcpListener, shared: Arc<ServerShared>) {
    if listener.set_nonblocking(true).is_err() {
        warn!("failed to set control listener non-blocking, accept loop exiting");
        return;
    }

    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nonblocking(false);
                let shared = Arc::clone(&shared);
                let builder = thread::Builder::new().name(format!("session-{peer_addr}"));
                if let Err(err) = builder.spawn(move || handle_session(stream, peer_addr.to_string(), &shared)) {
                    warn!(error = %err, "failed to spawn session thread");
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock) => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                warn!(error = %err, "control listener accept error");
                break;
            }
        }
    }
}

/// Runs one accepted control-link connection to completion: authentication,
/// then (on success) the full session lifecycle. Exposed for callers that
/// manage their own accept loop (tests, embedders); [`serve`] is the normal
/// entry point.
pub fn handle_session(mut stream: TcpStream, peer: String, shared: &ServerShared) {
    match negotiate(&mut stream, shared) {
        Ok(Some(login)) => {
            info!(peer, login, "session authenticated");
            if let Err(err) = run_session(stream, &login, &peer, shared) {
                if !matches!(err, TunnelError::Cancelled) {
                    warn!(peer, login, error = %err, "session ended");
                }
            }
        }
        Ok(None) => {
            debug!(peer, "test dialect probe handled");
        }
        Err(err) => {
            debug!(peer, error = %err, "authentication rejected");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Reads one newline-terminated line, bounded by `timeouts.auth_timeout`
/// across the *whole* read, not just each individual `read()` call —
/// `set_read_timeout` only bounds a single syscall, so it is recomputed
/// against an absolute deadline every iteration (same pattern as
/// `BoundedQueue::push_timeout`'s deadline).
fn read_auth_line(stream: &mut TcpStream, timeouts: &Timeouts) -> Result<String, TunnelError> {
    let deadline = Instant::now() + timeouts.auth_timeout;
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if raw.len() >= MAX_AUTH_BYTES {
            return Err(TunnelError::Auth);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TunnelError::Auth);
        }
        stream.set_read_timeout(Some(remaining)).map_err(TunnelError::Transport)?;
        match stream.read(&mut byte) {
            Ok(0) => return Err(TunnelError::Auth),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                raw.push(byte[0]);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TunnelError::Auth);
            }
            Err(err) => return Err(TunnelError::Transport(err)),
        }
    }
    String::from_utf8(raw).map(|s| s.trim_end().to_string()).map_err(|_| TunnelError::Auth)
}

/// Runs the `Accepted -> Authenticating` transition. `Ok(Some(login))`
/// means the real dialect succeeded and the caller should provision a
/// session; `Ok(None)` means the test dialect was handled to completion
/// (link already closed); `Err` means the link should be rejected.
fn negotiate(stream: &mut TcpStream, shared: &ServerShared) -> Result<Option<String>, TunnelError> {
    let line = read_auth_line(stream, &shared.timeouts)?;
    match parse_auth_line(&line) {
        Some(AuthAttempt::Test(creds)) => {
            if shared.verifier.verify(&creds.login, &creds.password) {
                let _ = stream.write_all(b"OK");
            }
            let _ = stream.shutdown(Shutdown::Both);
            Ok(None)
        }
        Some(AuthAttempt::Real(creds)) => {
            if shared.verifier.verify(&creds.login, &creds.password) {
                Ok(Some(creds.login))
            } else {
                Err(TunnelError::Auth)
            }
        }
        None => {
            warn!("unrecognized auth prelude shape");
            Err(TunnelError::Auth)
        }
    }
}

/// Runs `Provisioning -> Running -> Closing` for one authenticated session.
fn run_session(stream: TcpStream, login: &str, peer: &str, shared: &ServerShared) -> Result<(), TunnelError> {
    let public_port = shared.allocator.allocate().ok_or(TunnelError::PortAlloc)?;
    let guard = PortGuard { allocator: Arc::clone(&shared.allocator), port: public_port };

    let bind_addr = format!("{}:{public_port}", shared.bind_host);
    let public_listener = TcpListener::bind(&bind_addr).map_err(TunnelError::Transport)?;

    let (link, mut read_half) = ControlLink::split(stream).map_err(TunnelError::Transport)?;
    link.send(FrameType::NewConnection, 0, &u32::from(public_port).to_be_bytes())?;
    info!(login, peer, public_port, "public listener bound");

    let registry = Arc::new(VcRegistry::new());
    let pipes: Arc<Mutex<Vec<Pipe>>> = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let accept_handle = {
        let link = link.clone();
        let registry = Arc::clone(&registry);
        let pipes = Arc::clone(&pipes);
        let stop = Arc::clone(&stop);
        let timeouts = shared.timeouts;
        let queue_size = shared.vc_queue_size;
        thread::Builder::new()
            .name(format!("accept-{public_port}"))
            .spawn(move || accept_loop(public_listener, public_port, link, registry, pipes, queue_size, timeouts, &stop))
            .expect("failed to spawn accept loop thread")
    };

    let frame_result = frame_loop(&mut read_half, &link, &registry, &shared.timeouts, &shared.stop);

    stop.store(true, Ordering::SeqCst);
    let _ = accept_handle.join();

    for (_, entry) in registry.snapshot_and_clear() {
        entry.closed.store(true, Ordering::SeqCst);
        let _ = entry.socket.shutdown(Shutdown::Both);
    }
    for pipe in std::mem::take(&mut *pipes.lock().unwrap_or_else(|e| e.into_inner())) {
        if !pipe.join_within(shared.timeouts.cleanup_timeout) {
            warn!(login, public_port, "vc pipe outlived cleanup timeout");
        }
    }
    link.shutdown();
    drop(guard);

    frame_result
}

/// Releases the public port back to the allocator when dropped, so every
/// exit path out of `run_session` (including `?` early-returns) reclaims it.
struct PortGuard {
    allocator: Arc<PortAllocator>,
    port: u16,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    public_port: u16,
    link: ControlLink,
    registry: Arc<VcRegistry>,
    pipes: Arc<Mutex<Vec<Pipe>>>,
    queue_size: usize,
    timeouts: Timeouts,
    stop: &AtomicBool,
) {
    if listener.set_nonblocking(true).is_err() {
        warn!("failed to set public listener non-blocking, accept loop exiting");
        return;
    }

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((socket, external_addr)) => {
                let _ = socket.set_nonblocking(false);
                if crate::sockopt::set_keepalive(&socket).is_err() {
                    debug!("failed to set SO_KEEPALIVE on accepted socket");
                }

                let Some((id, closed)) = register_with_fresh_id(&registry, &socket) else {
                    warn!(external = %external_addr, "failed to register new virtual connection");
                    continue;
                };

                if link.send(FrameType::NewConnection, id, &u32::from(public_port).to_be_bytes()).is_err() {
                    registry.remove(id);
                    break;
                }

                info!(vc = id, external = %external_addr, "external connection accepted");
                let pipe = Pipe::spawn(
                    id,
                    socket,
                    link.clone(),
                    Arc::clone(&registry),
                    closed,
                    queue_size,
                    timeouts.read_timeout,
                    timeouts.put_timeout,
                    None,
                );
                pipes.lock().unwrap_or_else(|e| e.into_inner()).push(pipe);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock) => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                warn!(error = %err, "public listener accept error");
                break;
            }
        }
    }
}

/// Draws a fresh random id in `[1, 2^31-1]`, rerolling on the (astronomically
/// rare) collision with an id already in the registry, per spec §9. Returns
/// the id alongside the `closed` flag the registry entry and the VC's
/// `Pipe` must share.
fn register_with_fresh_id(registry: &VcRegistry, socket: &TcpStream) -> Option<(u32, Arc<AtomicBool>)> {
    loop {
        let candidate = rand::rng().random_range(1..=MAX_CONNECTION_ID);
        let clone = socket.try_clone().ok()?;
        let closed = Arc::new(AtomicBool::new(false));
        if registry.insert(candidate, clone, Arc::clone(&closed)) {
            return Some((candidate, closed));
        }
    }
}

/// The server's `Running` frame dispatch loop: unpack frames with a
/// per-read timeout (non-fatal) and dispatch by type. Returns once the
/// control link fails, a malformed frame is seen, or `stop` is raised.
fn frame_loop(
    read_half: &mut TcpStream,
    link: &ControlLink,
    registry: &VcRegistry,
    timeouts: &Timeouts,
    stop: &AtomicBool,
) -> Result<(), TunnelError> {
    read_half.set_read_timeout(Some(timeouts.read_timeout)).map_err(TunnelError::Transport)?;

    loop {
        if stop.load(Ordering::SeqCst) {
            return Err(TunnelError::Cancelled);
        }

        let frame = match unpack(read_half) {
            Ok(frame) => frame,
            Err(err) if err.is_retryable_timeout() => continue,
            Err(err) => return Err(err.into()),
        };

        match frame.frame_type {
            FrameType::Ping => {
                link.send(FrameType::Pong, frame.connection_id, &frame.payload)?;
            }
            FrameType::Data => dispatch_data(registry, &frame),
            FrameType::Close => {
                if let Some(entry) = registry.remove(frame.connection_id) {
                    entry.closed.store(true, Ordering::SeqCst);
                    let _ = entry.socket.shutdown(Shutdown::Both);
                }
            }
            FrameType::NewConnection | FrameType::Pong => {
                warn!(frame_type = ?frame.frame_type, "unexpected frame from client, ignoring");
            }
        }
    }
}

fn dispatch_data(registry: &VcRegistry, frame: &Frame) {
    let Some(mut socket) = registry.get_clone(frame.connection_id) else {
        return;
    };
    if let Err(err) = socket.write_all(&frame.payload) {
        log_vc_error(frame.connection_id, TunnelError::PeerIo(err));
        // Leave the `closed` flag untouched: shutting down the socket here
        // makes the vc's own reader thread observe the error and run
        // `teardown_once` for the first time, emitting the one CLOSE frame.
        if let Some(entry) = registry.remove(frame.connection_id) {
            let _ = entry.socket.shutdown(Shutdown::Both);
        }
    }
}
