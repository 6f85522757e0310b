use std::{
    io::Write,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info, warn};
use tunnel_protocol::{FrameType, unpack};

use crate::{
    error::TunnelError,
    link::ControlLink,
    observer::{ClientObserver, PingBand, SessionState},
    pipe::{Pipe, TrafficSink, log_vc_error},
    registry::VcRegistry,
    timeouts::Timeouts,
};

/// Everything one client session needs: where to connect, what to
/// authenticate as, and where the local service lives.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub login: String,
    pub password: String,
    pub local_port: u16,
    pub timeouts: Timeouts,
    pub vc_queue_size: usize,
    pub max_retries: u32,
}

/// Drives the client state machine end to end: `Connecting -> Authenticating
/// -> Running -> Closing`, with the reconnect supervisor (§4.8) wrapped
/// around involuntary drops.
pub struct TunnelClient {
    config: ClientConfig,
    observer: Arc<dyn ClientObserver>,
    stop: Arc<AtomicBool>,
}

enum LoopExit {
    Stopped,
    Failed(TunnelError),
}

enum SessionOutcome {
    Stopped,
    Disconnected { authenticated: bool },
}

impl TunnelClient {
    pub fn new(config: ClientConfig, observer: Arc<dyn ClientObserver>) -> Self {
        Self { config, observer, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// A handle callers can flip (e.g. from a `ctrlc` handler) to request an
    /// orderly shutdown instead of another reconnect.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the reconnect supervisor loop until explicitly stopped or until
    /// `max_retries` consecutive authentication failures are reached.
    pub fn run(&self) {
        let mut retries: u32 = 0;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.observer.on_state(SessionState::Connecting);
            match self.run_once() {
                SessionOutcome::Stopped => break,
                SessionOutcome::Disconnected { authenticated } => {
                    if authenticated {
                        retries = 0;
                    } else {
                        retries += 1;
                    }
                    if retries > self.config.max_retries {
                        warn!(retries, "giving up after exceeding max retries");
                        break;
                    }
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    self.observer.on_state(SessionState::Reconnecting);
                    thread::sleep(self.config.timeouts.retry_delay);
                }
            }
        }
        self.observer.on_state(SessionState::Terminated);
    }

    fn run_once(&self) -> SessionOutcome {
        self.observer.on_state(SessionState::Authenticating);

        let mut stream = match dial(self.config.server_addr, self.config.timeouts.dial_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "dial failed");
                return SessionOutcome::Disconnected { authenticated: false };
            }
        };

        let public_port = match authenticate(&mut stream, &self.config.login, &self.config.password, &self.config.timeouts) {
            Ok(port) => port,
            Err(err) => {
                debug!(error = %err, "authentication failed");
                let _ = stream.shutdown(Shutdown::Both);
                return SessionOutcome::Disconnected { authenticated: false };
            }
        };

        info!(server = %self.config.server_addr, public_port, "authenticated");
        self.observer.on_state(SessionState::Running);
        self.observer.on_public_address(&self.config.server_addr.ip().to_string(), public_port);

        let (link, mut read_half) = match ControlLink::split(stream) {
            Ok(pair) => pair,
            Err(err) => {
                debug!(error = %err, "failed to split control link");
                return SessionOutcome::Disconnected { authenticated: true };
            }
        };

        let registry = Arc::new(VcRegistry::new());
        let pipes: Arc<Mutex<Vec<Pipe>>> = Arc::new(Mutex::new(Vec::new()));
        let link_stop = Arc::new(AtomicBool::new(false));
        let last_pong_at = Arc::new(Mutex::new(Instant::now()));

        let ping_handle = {
            let link = link.clone();
            let link_stop = Arc::clone(&link_stop);
            let observer = Arc::clone(&self.observer);
            let timeouts = self.config.timeouts;
            let last_pong_at = Arc::clone(&last_pong_at);
            thread::Builder::new()
                .name("ping-loop".to_string())
                .spawn(move || ping_loop(&link, &link_stop, timeouts, observer.as_ref(), &last_pong_at))
                .expect("failed to spawn ping loop thread")
        };

        let exit = frame_loop(
            &mut read_half,
            &link,
            &registry,
            &pipes,
            &self.config,
            &self.observer,
            &self.stop,
            &link_stop,
            &last_pong_at,
        );

        link_stop.store(true, Ordering::SeqCst);
        let _ = ping_handle.join();

        self.observer.on_state(SessionState::Closing);
        for (_, entry) in registry.snapshot_and_clear() {
            entry.closed.store(true, Ordering::SeqCst);
            let _ = entry.socket.shutdown(Shutdown::Both);
        }
        for pipe in std::mem::take(&mut *pipes.lock().unwrap_or_else(|e| e.into_inner())) {
            if !pipe.join_within(self.config.timeouts.cleanup_timeout) {
                warn!("vc pipe outlived cleanup timeout");
            }
        }
        link.shutdown();

        match exit {
            LoopExit::Stopped => SessionOutcome::Stopped,
            LoopExit::Failed(err) => {
                warn!(error = %err, "control link failed, will reconnect");
                SessionOutcome::Disconnected { authenticated: true }
            }
        }
    }
}

fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TunnelError> {
    TcpStream::connect_timeout(&addr, timeout).map_err(TunnelError::Transport)
}

fn authenticate(stream: &mut TcpStream, login: &str, password: &str, timeouts: &Timeouts) -> Result<u16, TunnelError> {
    stream.set_write_timeout(Some(timeouts.write_timeout)).map_err(TunnelError::Transport)?;
    let line = format!("{login}:{password}\n");
    stream.write_all(line.as_bytes()).map_err(TunnelError::Transport)?;

    stream.set_read_timeout(Some(timeouts.auth_timeout)).map_err(TunnelError::Transport)?;
    let frame = unpack(stream)?;
    if frame.frame_type != FrameType::NewConnection || frame.connection_id != 0 || frame.payload.len() != 4 {
        return Err(TunnelError::Auth);
    }
    let port = u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]);
    Ok(port as u16)
}

/// Encodes the current time as an 8-character ASCII decimal string, per
/// spec.md §8 S3's "8-byte ASCII timestamp payloads" — the wire protocol
/// MUST be bit-exact across implementations, so this can't be raw binary.
/// Millisecond resolution, wrapped into 8 digits (rolls over every ~27.7h;
/// each PING is matched against its own immediate PONG, so the window in
/// which a wraparound could corrupt an RTT reading is negligible).
fn now_token() -> [u8; 8] {
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let wrapped = millis % 100_000_000;
    let mut token = [0u8; 8];
    token.copy_from_slice(format!("{wrapped:08}").as_bytes());
    token
}

fn parse_token_ms(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

fn ping_loop(
    link: &ControlLink,
    link_stop: &AtomicBool,
    timeouts: Timeouts,
    observer: &dyn ClientObserver,
    last_pong_at: &Mutex<Instant>,
) {
    let stale_threshold = timeouts.stale_threshold();
    loop {
        if link_stop.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(timeouts.ping_interval);
        if link_stop.load(Ordering::SeqCst) {
            break;
        }

        if link.send(FrameType::Ping, 0, &now_token()).is_err() {
            warn!("ping send failed, forcing reconnect");
            link_stop.store(true, Ordering::SeqCst);
            break;
        }

        let elapsed = last_pong_at.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
        if elapsed > stale_threshold {
            observer.on_ping(None, PingBand::Stale);
            warn!(?elapsed, "control link stale, forcing reconnect");
            link_stop.store(true, Ordering::SeqCst);
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn frame_loop(
    read_half: &mut TcpStream,
    link: &ControlLink,
    registry: &Arc<VcRegistry>,
    pipes: &Arc<Mutex<Vec<Pipe>>>,
    config: &ClientConfig,
    observer: &Arc<dyn ClientObserver>,
    stop: &AtomicBool,
    link_stop: &AtomicBool,
    last_pong_at: &Mutex<Instant>,
) -> LoopExit {
    if let Err(err) = read_half.set_read_timeout(Some(config.timeouts.read_timeout)) {
        return LoopExit::Failed(TunnelError::Transport(err));
    }

    loop {
        if stop.load(Ordering::SeqCst) || link_stop.load(Ordering::SeqCst) {
            return LoopExit::Stopped;
        }

        let frame = match unpack(read_half) {
            Ok(frame) => frame,
            Err(err) if err.is_retryable_timeout() => continue,
            Err(err) => return LoopExit::Failed(err.into()),
        };

        match frame.frame_type {
            FrameType::Pong => {
                *last_pong_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                if let Some(sent_ms) = parse_token_ms(&frame.payload) {
                    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
                        % 100_000_000;
                    let rtt = now_ms.checked_sub(sent_ms).unwrap_or_else(|| now_ms + 100_000_000 - sent_ms);
                    observer.on_ping(Some(rtt), PingBand::classify(rtt));
                }
            }
            FrameType::NewConnection if frame.connection_id == 0 => {
                if frame.payload.len() == 4 {
                    let port = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
                    observer.on_public_address(&config.server_addr.ip().to_string(), port as u16);
                }
            }
            FrameType::NewConnection => {
                open_virtual_connection(frame.connection_id, link, registry, pipes, config, observer);
            }
            FrameType::Data => dispatch_data(registry, frame.connection_id, &frame.payload),
            FrameType::Close => {
                if let Some(entry) = registry.remove(frame.connection_id) {
                    entry.closed.store(true, Ordering::SeqCst);
                    let _ = entry.socket.shutdown(Shutdown::Both);
                }
            }
            FrameType::Ping => {
                warn!("unexpected ping from server, ignoring");
            }
        }
    }
}

fn open_virtual_connection(
    id: u32,
    link: &ControlLink,
    registry: &Arc<VcRegistry>,
    pipes: &Arc<Mutex<Vec<Pipe>>>,
    config: &ClientConfig,
    observer: &Arc<dyn ClientObserver>,
) {
    let local_addr: SocketAddr = (std::net::Ipv4Addr::LOCALHOST, config.local_port).into();
    match TcpStream::connect_timeout(&local_addr, config.timeouts.local_dial_timeout) {
        Ok(local_stream) => {
            let Ok(clone) = local_stream.try_clone() else {
                let _ = link.send(FrameType::Close, id, &[]);
                return;
            };
            let closed = Arc::new(AtomicBool::new(false));
            if !registry.insert(id, clone, Arc::clone(&closed)) {
                let _ = link.send(FrameType::Close, id, &[]);
                return;
            }
            let traffic_observer = Arc::clone(observer);
            let traffic: TrafficSink = Arc::new(move |up, down| traffic_observer.on_traffic(up, down));
            let pipe = Pipe::spawn(
                id,
                local_stream,
                link.clone(),
                Arc::clone(registry),
                closed,
                config.vc_queue_size,
                config.timeouts.read_timeout,
                config.timeouts.put_timeout,
                Some(traffic),
            );
            pipes.lock().unwrap_or_else(|e| e.into_inner()).push(pipe);
        }
        Err(err) => {
            log_vc_error(id, TunnelError::LocalDial(err));
            let _ = link.send(FrameType::Close, id, &[]);
        }
    }
}

fn dispatch_data(registry: &VcRegistry, id: u32, payload: &[u8]) {
    let Some(mut socket) = registry.get_clone(id) else {
        return;
    };
    if let Err(err) = socket.write_all(payload) {
        log_vc_error(id, TunnelError::PeerIo(err));
        // Leave `closed` unmarked: shutting down here lets the vc's own
        // reader thread discover the error and emit the one CLOSE frame.
        if let Some(entry) = registry.remove(id) {
            let _ = entry.socket.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_line_is_newline_terminated_plain_ascii() {
        let login = "alice";
        let password = "hunter2";
        let line = format!("{login}:{password}\n");
        assert_eq!(line, "alice:hunter2\n");
    }
}
