use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use appfaders::protocol::{ErrorCode, Opcode, Request, Response, read_response};
use appfaders::{
    BridgeConfig, CacheBridge, ClientConfig, ClientError, ConnectionState, GainClient,
    GainService, ReadOnlyClient, ServiceConfig, ValidationError,
};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(2);

fn start_service() -> (TempDir, ServiceConfig, appfaders::ServiceHandle) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::in_dir(dir.path().join("sockets"));
    let handle = GainService::new().serve(&config).unwrap();
    (dir, config, handle)
}

fn client_for(config: &ServiceConfig) -> GainClient {
    GainClient::connect(&ClientConfig {
        socket: config.trusted_socket.clone(),
        request_timeout: TIMEOUT,
    })
    .unwrap()
}

fn bridge_for(config: &ServiceConfig) -> CacheBridge {
    CacheBridge::new(BridgeConfig {
        socket: config.restricted_socket.clone(),
        reconnect_backoff: Duration::from_millis(100),
        refresh_interval: Duration::from_millis(50),
        request_timeout: TIMEOUT,
    })
    .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn raw_call(socket: &std::path::Path, frame: &[u8], sent: Opcode) -> Response {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(frame).unwrap();
    read_response(&mut stream, sent).unwrap()
}

#[test]
fn trusted_client_round_trip() {
    let (_dir, config, _service) = start_service();
    let client = client_for(&config);

    assert_eq!(client.get_gain("com.never.set").unwrap(), 1.0);
    client.set_gain("com.spotify.client", 0.37).unwrap();
    assert_eq!(client.get_gain("com.spotify.client").unwrap(), 0.37);
    client.set_gain("com.apple.Music", 0.0).unwrap();

    let all = client.all_gains().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["com.apple.Music"], 0.0);

    client.remove_gain("com.spotify.client").unwrap();
    assert_eq!(client.get_gain("com.spotify.client").unwrap(), 1.0);
}

#[test]
fn async_calls_deliver_results_on_channel() {
    let (_dir, config, _service) = start_service();
    let client = client_for(&config);
    client
        .set_gain_async("org.mozilla.firefox", 0.6)
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    let gain = client
        .get_gain_async("org.mozilla.firefox")
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(gain, 0.6);
}

#[test]
fn restricted_interface_rejects_every_write() {
    let (_dir, config, _service) = start_service();

    let valid = Request::SetGain {
        app_id: "com.example".into(),
        gain: 0.5,
    };
    let invalid = Request::SetGain {
        app_id: "com.example".into(),
        gain: 7.0,
    };
    let remove = Request::RemoveGain {
        app_id: "com.example".into(),
    };
    for request in [valid, invalid, remove] {
        let response = raw_call(
            &config.restricted_socket,
            &request.encode().unwrap(),
            request.opcode(),
        );
        assert_eq!(response, Response::Rejected(ErrorCode::ReadOnly));
    }

    let reader = ReadOnlyClient::connect(&config.restricted_socket, TIMEOUT).unwrap();
    assert_eq!(reader.get_gain("com.example").unwrap(), 1.0);
    assert!(reader.all_gains().unwrap().is_empty());
}

#[test]
fn service_rejects_invalid_writes_with_typed_codes() {
    let (_dir, config, _service) = start_service();

    let out_of_range = Request::SetGain {
        app_id: "com.example".into(),
        gain: 1.5,
    };
    let response = raw_call(
        &config.trusted_socket,
        &out_of_range.encode().unwrap(),
        Opcode::SetGain,
    );
    assert_eq!(response, Response::Rejected(ErrorCode::GainOutOfRange));

    let nan = Request::SetGain {
        app_id: "com.example".into(),
        gain: f32::NAN,
    };
    let response = raw_call(&config.trusted_socket, &nan.encode().unwrap(), Opcode::SetGain);
    assert_eq!(response, Response::Rejected(ErrorCode::GainOutOfRange));

    let empty = Request::SetGain {
        app_id: String::new(),
        gain: 0.5,
    };
    let response = raw_call(&config.trusted_socket, &empty.encode().unwrap(), Opcode::SetGain);
    assert_eq!(response, Response::Rejected(ErrorCode::EmptyIdentifier));

    let response = raw_call(&config.trusted_socket, &[0x7f], Opcode::AllGains);
    assert_eq!(response, Response::Rejected(ErrorCode::Malformed));

    let client = client_for(&config);
    assert!(client.all_gains().unwrap().is_empty());
}

#[test]
fn identifier_bounds_are_distinguishable() {
    let (_dir, config, _service) = start_service();
    let client = client_for(&config);

    let exact = "a".repeat(255);
    client.set_gain(&exact, 0.25).unwrap();
    assert_eq!(client.get_gain(&exact).unwrap(), 0.25);

    match client.set_gain(&"a".repeat(256), 0.25) {
        Err(ClientError::Validation(ValidationError::IdentifierTooLong { len })) => {
            assert_eq!(len, 256)
        }
        other => panic!("expected IdentifierTooLong, got {other:?}"),
    }
    match client.set_gain("", 0.25) {
        Err(ClientError::Validation(ValidationError::EmptyIdentifier)) => {}
        other => panic!("expected EmptyIdentifier, got {other:?}"),
    }
}

#[test]
fn unreachable_service_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let err = GainClient::connect(&ClientConfig {
        socket: dir.path().join("nobody-home.sock"),
        request_timeout: TIMEOUT,
    })
    .err()
    .unwrap();
    assert!(matches!(err, ClientError::Unreachable { .. }));
    assert!(err.is_connectivity());
    assert!(started.elapsed() < TIMEOUT);
}

#[test]
fn client_redials_after_service_restart() {
    let (_dir, config, service) = start_service();
    let client = client_for(&config);
    client.set_gain("com.example", 0.2).unwrap();

    service.shutdown();
    // Let the old connection threads notice the shutdown.
    thread::sleep(Duration::from_millis(500));
    let _restarted = GainService::new().serve(&config).unwrap();

    client.set_gain("com.example", 0.8).unwrap();
    assert_eq!(client.get_gain("com.example").unwrap(), 0.8);
}

#[test]
fn bridge_follows_updates_and_survives_service_loss() {
    let (_dir, config, service) = start_service();
    let client = client_for(&config);
    client.set_gain("com.spotify.client", 0.4).unwrap();

    let bridge = bridge_for(&config);
    assert_eq!(bridge.get_gain("com.spotify.client"), 1.0);
    bridge.connect();
    assert!(wait_until(|| bridge.get_gain("com.spotify.client") == 0.4));
    assert_eq!(bridge.state(), ConnectionState::Connected);
    assert!(bridge.snapshot_generation() >= 1);

    client.set_gain("com.spotify.client", 0.9).unwrap();
    assert!(wait_until(|| bridge.get_gain("com.spotify.client") == 0.9));

    service.shutdown();
    assert!(wait_until(|| bridge.state() != ConnectionState::Connected));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(bridge.get_gain("com.spotify.client"), 0.9);
    assert_eq!(bridge.get_gain("com.unknown"), 1.0);

    bridge.clear_cache();
    assert!(wait_until(|| bridge.get_gain("com.spotify.client") == 1.0));

    bridge.disconnect();
    assert!(wait_until(|| bridge.state() == ConnectionState::Disconnected));
}

#[test]
fn bridge_reconnects_when_service_returns() {
    let (_dir, config, service) = start_service();
    let bridge = bridge_for(&config);
    bridge.connect();
    assert!(wait_until(|| bridge.state() == ConnectionState::Connected));

    service.shutdown();
    assert!(wait_until(|| bridge.state() == ConnectionState::Interrupted
        || bridge.state() == ConnectionState::Connecting));

    let _restarted = GainService::new().serve(&config).unwrap();
    let client = client_for(&config);
    client.set_gain("us.zoom.xos", 0.3).unwrap();
    assert!(wait_until(|| bridge.get_gain("us.zoom.xos") == 0.3));
    assert_eq!(bridge.state(), ConnectionState::Connected);
}

#[test]
fn connections_past_the_limit_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig::in_dir(dir.path().join("sockets"));
    config.max_connections = 2;
    let _service = GainService::new().serve(&config).unwrap();

    let readers: Vec<ReadOnlyClient> = (0..2)
        .map(|_| {
            let reader = ReadOnlyClient::connect(&config.restricted_socket, TIMEOUT).unwrap();
            // A round trip proves the service accepted this connection.
            assert!(reader.all_gains().unwrap().is_empty());
            reader
        })
        .collect();

    let mut extra = UnixStream::connect(&config.restricted_socket).unwrap();
    extra.set_read_timeout(Some(TIMEOUT)).unwrap();
    let _ = extra.write_all(&Request::AllGains.encode().unwrap());
    assert!(read_response(&mut extra, Opcode::AllGains).is_err());

    for reader in &readers {
        assert_eq!(reader.get_gain("com.example").unwrap(), 1.0);
    }

    drop(readers);
    assert!(wait_until(|| {
        ReadOnlyClient::connect(&config.restricted_socket, TIMEOUT)
            .and_then(|reader| reader.all_gains())
            .is_ok()
    }));
}

#[test]
fn second_service_does_not_steal_a_live_socket() {
    let (_dir, config, _service) = start_service();
    let client = client_for(&config);
    client.set_gain("com.example", 0.5).unwrap();

    match GainService::new().serve(&config) {
        Err(appfaders::ServiceError::Bind { path, .. }) => {
            assert_eq!(path, config.trusted_socket)
        }
        Err(other) => panic!("expected Bind error, got {other}"),
        Ok(_) => panic!("second service bound a live socket"),
    }
    assert_eq!(client.get_gain("com.example").unwrap(), 0.5);
}
