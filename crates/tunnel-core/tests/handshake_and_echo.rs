use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use tunnel_core::{
    Account, ClientConfig, ClientObserver, Config, PortAllocator, PortRange, ServerShared,
    SessionState, Timeouts, TunnelClient, handle_session,
};

fn fast_timeouts() -> Timeouts {
    Timeouts {
        auth_timeout: Duration::from_millis(500),
        dial_timeout: Duration::from_millis(500),
        local_dial_timeout: Duration::from_millis(300),
        read_timeout: Duration::from_millis(100),
        write_timeout: Duration::from_millis(500),
        ping_interval: Duration::from_millis(200),
        put_timeout: Duration::from_millis(500),
        retry_delay: Duration::from_millis(200),
        cleanup_timeout: Duration::from_millis(500),
    }
}

fn server_shared(accounts: Vec<Account>, port_range: PortRange) -> Arc<ServerShared> {
    let mut config = Config::default();
    config.accounts = accounts;
    config.port_range = port_range;
    Arc::new(ServerShared {
        verifier: Arc::new(config.clone()),
        allocator: Arc::new(PortAllocator::new(config.port_range)),
        timeouts: fast_timeouts(),
        bind_host: "127.0.0.1".to_string(),
        vc_queue_size: 100,
        stop: Arc::new(AtomicBool::new(false)),
    })
}

/// S1 — test-dialect handshake: valid credentials get literal `OK` then EOF,
/// and no session persists.
#[test]
fn test_dialect_handshake_returns_ok_then_closes() {
    let shared = server_shared(
        vec![Account { login: "alice".into(), password: "hunter2".into() }],
        PortRange { low: 20200, high: 20210 },
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        handle_session(stream, peer.to_string(), &shared);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"__test__:alice:hunter2\n").unwrap();

    let mut response = [0u8; 2];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"OK");

    let mut trailing = [0u8; 1];
    let n = client.read(&mut trailing).unwrap();
    assert_eq!(n, 0, "server must close the link after the test-dialect reply");
}

/// S1 variant — wrong credentials never get `OK`, and the link still closes.
#[test]
fn test_dialect_rejects_bad_credentials_without_ok() {
    let shared = server_shared(
        vec![Account { login: "alice".into(), password: "hunter2".into() }],
        PortRange { low: 20211, high: 20220 },
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        handle_session(stream, peer.to_string(), &shared);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"__test__:alice:wrongpw\n").unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).unwrap();
    assert!(buf.is_empty());
}

struct PortCapture(Mutex<mpsc::Sender<u16>>);

impl ClientObserver for PortCapture {
    fn on_public_address(&self, _host: &str, port: u16) {
        let _ = self.0.lock().unwrap().send(port);
    }
}

/// S2 — full session: client authenticates, server allocates a public port,
/// an external peer dials it, and bytes round-trip through the local echo
/// service.
#[test]
fn full_session_echoes_bytes_through_the_tunnel() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local_port = echo_listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut sock, _)) = echo_listener.accept() {
            let mut buf = [0u8; 1024];
            loop {
                match sock.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let shared = server_shared(
        vec![Account { login: "alice".into(), password: "hunter2".into() }],
        PortRange { low: 20230, high: 20250 },
    );
    let control_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, peer) = control_listener.accept().unwrap();
        handle_session(stream, peer.to_string(), &shared);
    });

    let (port_tx, port_rx) = mpsc::channel();
    let observer = Arc::new(PortCapture(Mutex::new(port_tx)));
    let client_config = ClientConfig {
        server_addr: control_addr,
        login: "alice".into(),
        password: "hunter2".into(),
        local_port,
        timeouts: fast_timeouts(),
        vc_queue_size: 100,
        max_retries: 0,
    };
    let client = Arc::new(TunnelClient::new(client_config, observer));
    let stop = client.stop_handle();
    let run_client = Arc::clone(&client);
    let client_thread = thread::spawn(move || run_client.run());

    let public_port = port_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!((20230..=20250).contains(&public_port));

    let mut external = TcpStream::connect(("127.0.0.1", public_port)).unwrap();
    external.write_all(b"hello").unwrap();
    let mut echoed = [0u8; 5];
    external.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");

    drop(external);
    thread::sleep(Duration::from_millis(300));

    stop.store(true, Ordering::SeqCst);
    client_thread.join().unwrap();
}

/// S4 — local dial failure: the client answers NEW_CONNECTION with CLOSE
/// and the session keeps running (no panic, no hang).
#[test]
fn local_dial_failure_emits_close_and_session_survives() {
    // Bind then drop the listener so the port is (almost certainly) closed.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let shared = server_shared(
        vec![Account { login: "alice".into(), password: "hunter2".into() }],
        PortRange { low: 20260, high: 20270 },
    );
    let control_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, peer) = control_listener.accept().unwrap();
        handle_session(stream, peer.to_string(), &shared);
    });

    let (port_tx, port_rx) = mpsc::channel();
    let observer = Arc::new(PortCapture(Mutex::new(port_tx)));
    let client_config = ClientConfig {
        server_addr: control_addr,
        login: "alice".into(),
        password: "hunter2".into(),
        local_port: closed_port,
        timeouts: fast_timeouts(),
        vc_queue_size: 100,
        max_retries: 0,
    };
    let client = Arc::new(TunnelClient::new(client_config, observer));
    let stop = client.stop_handle();
    let run_client = Arc::clone(&client);
    let client_thread = thread::spawn(move || run_client.run());

    let public_port = port_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Dialing the public port succeeds (server accepts), but the client's
    // local dial fails, so the external peer should observe a prompt close
    // rather than a hang.
    let mut external = TcpStream::connect(("127.0.0.1", public_port)).unwrap();
    external.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1];
    let n = external.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    stop.store(true, Ordering::SeqCst);
    client_thread.join().unwrap();
}

/// S6 — a malformed frame on the control link terminates the session: the
/// server closes the link rather than hanging or panicking.
#[test]
fn malformed_frame_terminates_session() {
    let shared = server_shared(
        vec![Account { login: "alice".into(), password: "hunter2".into() }],
        PortRange { low: 20280, high: 20290 },
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        handle_session(stream, peer.to_string(), &shared);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"alice:hunter2\n").unwrap();

    // Consume the NEW_CONNECTION(id=0, port) handshake reply before
    // injecting the bad frame.
    let mut header = [0u8; 9];
    client.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut payload = vec![0u8; len];
    client.read_exact(&mut payload).unwrap();

    // type=0xFF, connection_id=0, length=0 — an unknown frame type.
    client.write_all(&[0xFF, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server must close the link after a malformed frame");
}

struct StateCapture(Mutex<Vec<SessionState>>);

impl ClientObserver for StateCapture {
    fn on_state(&self, state: SessionState) {
        self.0.lock().unwrap().push(state);
    }
}

/// S5-adjacent — the reconnect supervisor gives up after exhausting
/// `max_retries` consecutive authentication failures rather than looping
/// forever.
#[test]
fn reconnect_supervisor_gives_up_after_max_retries() {
    // Nothing is listening on this port, so every dial attempt fails fast.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };

    let observer = Arc::new(StateCapture(Mutex::new(Vec::new())));
    let client_config = ClientConfig {
        server_addr: dead_addr,
        login: "alice".into(),
        password: "hunter2".into(),
        local_port: 0,
        timeouts: fast_timeouts(),
        vc_queue_size: 100,
        max_retries: 2,
    };
    let client = TunnelClient::new(client_config, observer.clone());
    client.run();

    let states = observer.0.lock().unwrap();
    assert_eq!(states.last(), Some(&SessionState::Terminated));
    assert!(states.iter().filter(|s| **s == SessionState::Connecting).count() >= 3);
}
