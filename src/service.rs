//! Authoritative gain service.
//!
//! One [`GainStore`] is exposed through two listeners. Connections accepted on
//! the trusted socket are served with a [`WriteCapability`]; connections
//! accepted on the restricted socket get a [`ReadCapability`], which has no
//! write methods at all, so writes arriving there are refused by type.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{ProtocolError, ServiceError, ValidationError};
use crate::protocol::{
    ErrorCode, Request, Response, read_request_body, validate_app_id, validate_gain, write_frame,
};
use crate::store::GainStore;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const IDLE_POLL: Duration = Duration::from_millis(200);
const BODY_TIMEOUT: Duration = Duration::from_secs(2);

/// Read-only view of the store handed to restricted connections.
#[derive(Clone)]
pub struct ReadCapability {
    store: Arc<GainStore>,
}

impl ReadCapability {
    /// Current gain for `app_id` (default 1.0).
    pub fn get_gain(&self, app_id: &str) -> Result<f32, ValidationError> {
        validate_app_id(app_id)?;
        Ok(self.store.get_gain(app_id))
    }

    /// Full copy of the map.
    pub fn all_gains(&self) -> HashMap<String, f32> {
        self.store.all_gains()
    }
}

/// Read-write view of the store handed to trusted connections.
#[derive(Clone)]
pub struct WriteCapability {
    read: ReadCapability,
}

impl WriteCapability {
    /// Validate and store a gain. Out of range values are rejected, not clamped.
    pub fn set_gain(&self, app_id: &str, gain: f32) -> Result<(), ValidationError> {
        validate_app_id(app_id)?;
        validate_gain(gain)?;
        self.read.store.set_gain(app_id, gain);
        info!(app_id, gain, "gain updated");
        Ok(())
    }

    /// Forget `app_id` so it reads as the default again.
    pub fn remove_gain(&self, app_id: &str) -> Result<(), ValidationError> {
        validate_app_id(app_id)?;
        if self.read.store.remove_gain(app_id).is_some() {
            info!(app_id, "gain removed");
        }
        Ok(())
    }

    /// Current gain for `app_id` (default 1.0).
    pub fn get_gain(&self, app_id: &str) -> Result<f32, ValidationError> {
        self.read.get_gain(app_id)
    }

    /// Full copy of the map.
    pub fn all_gains(&self) -> HashMap<String, f32> {
        self.read.all_gains()
    }

    /// Drop write access.
    pub fn read_only(&self) -> ReadCapability {
        self.read.clone()
    }
}

/// Turns decoded requests into responses for one kind of connection.
pub trait Capability: Clone + Send + 'static {
    /// Interface name used in logs.
    const INTERFACE: &'static str;

    /// Answer one request.
    fn handle(&self, request: Request) -> Response;
}

fn answer<T>(result: Result<T, ValidationError>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(err) => {
            debug!(%err, "request rejected");
            Response::Rejected(err.code())
        }
    }
}

impl Capability for ReadCapability {
    const INTERFACE: &'static str = "restricted";

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetGain { app_id } => answer(self.get_gain(&app_id), Response::Gain),
            Request::AllGains => Response::Snapshot(self.all_gains()),
            Request::SetGain { app_id, .. } | Request::RemoveGain { app_id } => {
                warn!(app_id = %app_id, "write attempted on restricted interface");
                Response::Rejected(ErrorCode::ReadOnly)
            }
        }
    }
}

impl Capability for WriteCapability {
    const INTERFACE: &'static str = "trusted";

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::SetGain { app_id, gain } => {
                answer(self.set_gain(&app_id, gain), |()| Response::Done)
            }
            Request::GetGain { app_id } => answer(self.get_gain(&app_id), Response::Gain),
            Request::AllGains => Response::Snapshot(self.all_gains()),
            Request::RemoveGain { app_id } => {
                answer(self.remove_gain(&app_id), |()| Response::Done)
            }
        }
    }
}

/// Owner of the gain store; hands out capabilities and serves sockets.
#[derive(Default)]
pub struct GainService {
    store: Arc<GainStore>,
}

impl GainService {
    /// Service with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability for in-process trusted callers.
    pub fn write_capability(&self) -> WriteCapability {
        WriteCapability {
            read: self.read_capability(),
        }
    }

    /// Capability for in-process restricted callers.
    pub fn read_capability(&self) -> ReadCapability {
        ReadCapability {
            store: Arc::clone(&self.store),
        }
    }

    /// Bind both sockets and start serving on background threads.
    pub fn serve(&self, config: &ServiceConfig) -> Result<ServiceHandle, ServiceError> {
        fs::create_dir_all(&config.socket_dir)?;
        let trusted = bind(&config.trusted_socket, 0o600)?;
        let restricted = bind(&config.restricted_socket, 0o666)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let limit = config.max_connections;
        let threads = vec![
            spawn_listener(trusted, self.write_capability(), limit, Arc::clone(&shutdown))?,
            spawn_listener(restricted, self.read_capability(), limit, Arc::clone(&shutdown))?,
        ];
        info!(
            trusted = %config.trusted_socket.display(),
            restricted = %config.restricted_socket.display(),
            "gain service listening"
        );

        Ok(ServiceHandle {
            shutdown,
            threads,
            sockets: vec![
                config.trusted_socket.clone(),
                config.restricted_socket.clone(),
            ],
        })
    }
}

fn bind(path: &Path, mode: u32) -> Result<UnixListener, ServiceError> {
    if UnixStream::connect(path).is_ok() {
        return Err(ServiceError::Bind {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "another service is listening"),
        });
    }
    // Nobody answers, so the file is left over from a dead instance.
    let _ = fs::remove_file(path);
    let listener = UnixListener::bind(path).map_err(|source| ServiceError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn spawn_listener<C: Capability>(
    listener: UnixListener,
    capability: C,
    limit: usize,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("gain-service-{}", C::INTERFACE))
        .spawn(move || accept_loop(listener, capability, limit, shutdown))
}

/// Releases a connection slot when the connection thread ends.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn accept_loop<C: Capability>(
    listener: UnixListener,
    capability: C,
    limit: usize,
    shutdown: Arc<AtomicBool>,
) {
    let live = Arc::new(AtomicUsize::new(0));
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if live.load(Ordering::Acquire) >= limit {
                    warn!(interface = C::INTERFACE, limit, "connection limit reached, refusing client");
                    drop(stream);
                    continue;
                }
                live.fetch_add(1, Ordering::AcqRel);
                let slot = Slot(Arc::clone(&live));
                debug!(interface = C::INTERFACE, "client connected");
                let capability = capability.clone();
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("gain-conn-{}", C::INTERFACE))
                    .spawn(move || {
                        let _slot = slot;
                        if let Err(err) = serve_connection(stream, &capability, &shutdown) {
                            debug!(interface = C::INTERFACE, %err, "connection closed");
                        }
                    });
                // A failed spawn drops the closure, and the slot with it.
                if let Err(err) = spawned {
                    warn!(interface = C::INTERFACE, %err, "cannot spawn connection thread");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(interface = C::INTERFACE, %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection<C: Capability>(
    mut stream: UnixStream,
    capability: &C,
    shutdown: &AtomicBool,
) -> Result<(), ProtocolError> {
    // Accepted sockets inherit O_NONBLOCK from the listener on some platforms.
    stream.set_nonblocking(false)?;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        stream.set_read_timeout(Some(IDLE_POLL))?;
        let mut opcode = [0u8; 1];
        match stream.read(&mut opcode) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        stream.set_read_timeout(Some(BODY_TIMEOUT))?;
        let (response, keep_open) = match read_request_body(opcode[0], &mut stream) {
            Ok(request) => (capability.handle(request), true),
            Err(ProtocolError::Io(err)) => return Err(ProtocolError::Io(err)),
            // The body length of an unknown opcode is unknown; stop reading after replying.
            Err(err @ ProtocolError::UnknownOpcode(_)) => {
                warn!(interface = C::INTERFACE, %err, "malformed request");
                (Response::Rejected(ErrorCode::Malformed), false)
            }
            Err(err) => {
                warn!(interface = C::INTERFACE, %err, "malformed request");
                (Response::Rejected(ErrorCode::Malformed), true)
            }
        };
        write_frame(&mut stream, &response.encode())?;
        if !keep_open {
            return Ok(());
        }
    }
}

/// Running listeners. Dropping the handle stops them and removes the sockets.
pub struct ServiceHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    sockets: Vec<PathBuf>,
}

impl ServiceHandle {
    /// Block until the listeners exit.
    pub fn wait(mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Stop accepting, let idle connections wind down and remove the sockets.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        for socket in &self.sockets {
            let _ = fs::remove_file(socket);
        }
        info!("gain service stopped");
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
