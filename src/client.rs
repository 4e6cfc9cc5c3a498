//! Synchronous clients for the gain service.
//!
//! [`GainClient`] dials the trusted socket and may write; [`ReadOnlyClient`]
//! dials the restricted socket and exposes only reads. Both keep one
//! connection open, drop it on a transport failure and redial once before
//! reporting the error.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ProtocolError};
use crate::protocol::{Request, Response, read_response, validate_app_id, validate_gain, write_frame};

struct Connection {
    socket: PathBuf,
    timeout: Duration,
    stream: Mutex<Option<UnixStream>>,
}

impl Connection {
    fn open(socket: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let connection = Self {
            socket: socket.to_path_buf(),
            timeout,
            stream: Mutex::new(None),
        };
        let stream = connection.dial()?;
        *connection.stream.lock() = Some(stream);
        Ok(connection)
    }

    fn dial(&self) -> Result<UnixStream, ClientError> {
        let unreachable = |source| ClientError::Unreachable {
            path: self.socket.clone(),
            source,
        };
        let stream = UnixStream::connect(&self.socket).map_err(unreachable)?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(unreachable)?;
        debug!(socket = %self.socket.display(), "connected to gain service");
        Ok(stream)
    }

    fn exchange(stream: &mut UnixStream, frame: &[u8], request: &Request) -> Result<Response, ProtocolError> {
        write_frame(stream, frame)?;
        read_response(stream, request.opcode())
    }

    /// Send `request`, redialling once if the cached stream turns out dead.
    fn call(&self, request: Request) -> Result<Response, ClientError> {
        let frame = request.encode()?;
        let mut guard = self.stream.lock();
        let mut redialled = false;
        loop {
            let stream = match guard.as_mut() {
                Some(stream) => stream,
                None => {
                    redialled = true;
                    guard.insert(self.dial()?)
                }
            };
            match Self::exchange(stream, &frame, &request) {
                Ok(Response::Rejected(code)) => return Err(ClientError::Rejected(code)),
                Ok(response) => return Ok(response),
                Err(ProtocolError::Io(err)) => {
                    // A half-finished exchange leaves the stream unusable.
                    *guard = None;
                    let err = ClientError::from(ProtocolError::Io(err));
                    if redialled || matches!(err, ClientError::Timeout) {
                        return Err(err);
                    }
                    warn!(%err, "gain service connection lost, redialling");
                }
                Err(other) => {
                    *guard = None;
                    return Err(other.into());
                }
            }
        }
    }

    fn get_gain(&self, app_id: &str) -> Result<f32, ClientError> {
        validate_app_id(app_id)?;
        match self.call(Request::GetGain {
            app_id: app_id.to_owned(),
        })? {
            Response::Gain(gain) => Ok(gain),
            other => Err(unexpected(other)),
        }
    }

    fn all_gains(&self) -> Result<HashMap<String, f32>, ClientError> {
        match self.call(Request::AllGains)? {
            Response::Snapshot(gains) => Ok(gains),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    warn!(?response, "response does not match request");
    ClientError::Protocol(ProtocolError::UnexpectedResponse)
}

/// Client of the trusted interface.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct GainClient {
    connection: Arc<Connection>,
}

impl GainClient {
    /// Dial the trusted socket named in `config`.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Arc::new(Connection::open(&config.socket, config.request_timeout)?),
        })
    }

    /// Store `gain` for `app_id`. Validation happens locally before sending.
    pub fn set_gain(&self, app_id: &str, gain: f32) -> Result<(), ClientError> {
        validate_app_id(app_id)?;
        validate_gain(gain)?;
        match self.connection.call(Request::SetGain {
            app_id: app_id.to_owned(),
            gain,
        })? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Current gain for `app_id`.
    pub fn get_gain(&self, app_id: &str) -> Result<f32, ClientError> {
        self.connection.get_gain(app_id)
    }

    /// Forget `app_id` on the service.
    pub fn remove_gain(&self, app_id: &str) -> Result<(), ClientError> {
        validate_app_id(app_id)?;
        match self.connection.call(Request::RemoveGain {
            app_id: app_id.to_owned(),
        })? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Every stored gain.
    pub fn all_gains(&self) -> Result<HashMap<String, f32>, ClientError> {
        self.connection.all_gains()
    }

    /// [`set_gain`](Self::set_gain) on a helper thread; the outcome arrives on
    /// the returned channel.
    pub fn set_gain_async(&self, app_id: &str, gain: f32) -> Receiver<Result<(), ClientError>> {
        let app_id = app_id.to_owned();
        self.spawn_call("set", move |client| client.set_gain(&app_id, gain))
    }

    /// [`get_gain`](Self::get_gain) on a helper thread.
    pub fn get_gain_async(&self, app_id: &str) -> Receiver<Result<f32, ClientError>> {
        let app_id = app_id.to_owned();
        self.spawn_call("get", move |client| client.get_gain(&app_id))
    }

    fn spawn_call<T, F>(&self, what: &str, call: F) -> Receiver<Result<T, ClientError>>
    where
        T: Send + 'static,
        F: FnOnce(&GainClient) -> Result<T, ClientError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let client = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("gain-client-{what}"))
            .spawn(move || {
                let _ = tx.send(call(&client));
            });
        if let Err(err) = spawned {
            warn!(%err, "cannot spawn gain client thread");
        }
        // A failed spawn drops the sender, so the receiver reports disconnection.
        rx
    }
}

/// Client of the restricted interface. Only reads are available.
#[derive(Clone)]
pub struct ReadOnlyClient {
    connection: Arc<Connection>,
}

impl ReadOnlyClient {
    /// Dial the restricted socket at `socket`.
    pub fn connect(socket: impl AsRef<Path>, request_timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Arc::new(Connection::open(socket.as_ref(), request_timeout)?),
        })
    }

    /// Current gain for `app_id`.
    pub fn get_gain(&self, app_id: &str) -> Result<f32, ClientError> {
        self.connection.get_gain(app_id)
    }

    /// Every stored gain.
    pub fn all_gains(&self) -> Result<HashMap<String, f32>, ClientError> {
        self.connection.all_gains()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            socket: dir.path().join("absent.sock"),
            request_timeout: Duration::from_millis(100),
        };
        match GainClient::connect(&config) {
            Err(err @ ClientError::Unreachable { .. }) => assert!(err.is_connectivity()),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected to a missing socket"),
        }
    }

    #[test]
    fn validation_errors_are_not_connectivity() {
        let err = ClientError::from(ValidationError::EmptyIdentifier);
        assert!(!err.is_connectivity());
    }
}
