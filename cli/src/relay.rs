//! Duplex byte relay between the local stdio pair and a VM socket.
//!
//! One relay runs in the calling thread. The only blocking point is the
//! `poll` over both endpoints, bounded by the idle timeout.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(900);
pub const CHUNK_SIZE: usize = 4096;

/// Which side of the relay hit end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// How a relay session ended. Every variant is a successful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Eof(Side),
    IdleTimeout,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub local_to_remote: u64,
    pub remote_to_local: u64,
}

/// The process's own stdin/stdout, unbuffered.
///
/// The descriptors are duplicated so reads bypass the std stdin buffer,
/// which would otherwise hold bytes `poll` cannot see.
pub struct LocalStdio {
    pub input: File,
    pub output: File,
}

impl LocalStdio {
    pub fn open() -> io::Result<Self> {
        let input = io::stdin().as_fd().try_clone_to_owned()?;
        let output = io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self {
            input: File::from(input),
            output: File::from(output),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamRelay {
    idle_timeout: Duration,
    detach_byte: Option<u8>,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl StreamRelay {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            detach_byte: None,
        }
    }

    /// End the session as a local EOF when `byte` is read from the local side.
    /// The byte and anything after it in the same chunk are not forwarded.
    pub fn with_detach_byte(mut self, byte: u8) -> Self {
        self.detach_byte = Some(byte);
        self
    }

    fn poll_timeout(&self) -> PollTimeout {
        i32::try_from(self.idle_timeout.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX)
    }

    /// Copy bytes both ways until either side reaches EOF or nothing happens
    /// for the idle timeout.
    pub fn run<L, W, R>(
        &self,
        local_in: &mut L,
        local_out: &mut W,
        remote: &mut R,
    ) -> io::Result<(RelayOutcome, RelayStats)>
    where
        L: Read + AsFd,
        W: Write,
        R: Read + Write + AsFd,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut stats = RelayStats::default();
        let timeout = self.poll_timeout();

        debug!(idle_timeout = ?self.idle_timeout, "relay started");

        loop {
            let (local_ready, remote_ready) = {
                let mut fds = [
                    PollFd::new(local_in.as_fd(), PollFlags::POLLIN),
                    PollFd::new(remote.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, timeout) {
                    Ok(0) => {
                        info!(?stats, "relay idle timeout reached");
                        return Ok((RelayOutcome::IdleTimeout, stats));
                    }
                    Ok(_) => (is_readable(&fds[0]), is_readable(&fds[1])),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            if local_ready {
                match read_chunk(local_in, &mut buf)? {
                    Some(0) => return Ok(finish(Side::Local, stats)),
                    Some(n) => {
                        let detach_at = self
                            .detach_byte
                            .and_then(|byte| buf[..n].iter().position(|&b| b == byte));
                        let end = detach_at.unwrap_or(n);
                        remote.write_all(&buf[..end])?;
                        stats.local_to_remote += end as u64;
                        if detach_at.is_some() {
                            debug!("detach requested");
                            return Ok(finish(Side::Local, stats));
                        }
                    }
                    None => {}
                }
            }

            if remote_ready {
                match read_chunk(remote, &mut buf)? {
                    Some(0) => return Ok(finish(Side::Remote, stats)),
                    Some(n) => {
                        local_out.write_all(&buf[..n])?;
                        local_out.flush()?;
                        stats.remote_to_local += n as u64;
                    }
                    None => {}
                }
            }
        }
    }
}

fn finish(side: Side, stats: RelayStats) -> (RelayOutcome, RelayStats) {
    info!(?side, ?stats, "relay endpoint closed");
    (RelayOutcome::Eof(side), stats)
}

// Hangup and error are reported as readable so the following read surfaces
// EOF or the error itself.
fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|revents| {
        revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

/// `None` means the read was spuriously woken and should be retried later.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
