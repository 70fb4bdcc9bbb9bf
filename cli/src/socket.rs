//! Rendezvous with sockets created by the VM's management process.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{Error, Result};

pub const DEFAULT_SOCKET_RETRIES: u32 = 9;
pub const DEFAULT_SOCKET_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a single connection attempt.
#[derive(Debug)]
pub enum ConnectAttempt {
    Connected(UnixStream),
    /// The socket does not exist (yet).
    NotReady,
    Failed(io::Error),
}

/// Capability to connect to a rendezvous socket.
pub trait SocketProvider {
    fn attempt_connect(&self, path: &Path) -> ConnectAttempt;
}

/// Connects to a Unix domain socket on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSocketProvider;

impl SocketProvider for UnixSocketProvider {
    fn attempt_connect(&self, path: &Path) -> ConnectAttempt {
        if !path.exists() {
            return ConnectAttempt::NotReady;
        }
        match UnixStream::connect(path) {
            Ok(stream) => ConnectAttempt::Connected(stream),
            Err(e) if e.kind() == io::ErrorKind::NotFound => ConnectAttempt::NotReady,
            Err(e) => ConnectAttempt::Failed(e),
        }
    }
}

/// Bounded wait for a socket the remote side is about to create.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_SOCKET_RETRIES,
            interval: DEFAULT_SOCKET_RETRY_INTERVAL,
        }
    }
}

pub struct SocketWaiter<P = UnixSocketProvider> {
    provider: P,
    policy: WaitPolicy,
}

impl SocketWaiter<UnixSocketProvider> {
    pub fn new(policy: WaitPolicy) -> Self {
        Self::with_provider(UnixSocketProvider, policy)
    }
}

impl<P: SocketProvider> SocketWaiter<P> {
    pub fn with_provider(provider: P, policy: WaitPolicy) -> Self {
        Self { provider, policy }
    }

    /// Connect to `path`, retrying while it is not ready.
    ///
    /// Only a missing socket is retried. A socket that exists but refuses the
    /// connection fails immediately.
    pub fn connect(&self, path: &Path) -> Result<UnixStream> {
        let mut attempt = 0;
        loop {
            match self.provider.attempt_connect(path) {
                ConnectAttempt::Connected(stream) => {
                    debug!(path = %path.display(), attempt, "connected to socket");
                    return Ok(stream);
                }
                ConnectAttempt::Failed(e) => {
                    return Err(Error::Connection {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
                ConnectAttempt::NotReady if attempt < self.policy.retries => {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, "socket not ready, waiting");
                    sleep(self.policy.interval);
                }
                ConnectAttempt::NotReady => {
                    warn!(path = %path.display(), "socket did not appear in time");
                    return Err(Error::Connection {
                        path: path.to_path_buf(),
                        reason: "socket does not exist".to_string(),
                    });
                }
            }
        }
    }
}
