//! Console operations: resolve the VM, rendezvous with its socket and relay
//! the process's stdin/stdout through it.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, Secret};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::qmp::QmpClient;
use crate::relay::{LocalStdio, RelayOutcome, RelayStats, StreamRelay};
use crate::socket::{SocketWaiter, WaitPolicy};
use crate::vm::{VmId, VmStore};

/// Ctrl+O, ends a serial console session.
pub const DETACH_KEY: u8 = 0x0f;

/// Which console of the VM to attach to.
#[derive(Debug)]
pub enum ConsoleTarget {
    /// Serial terminal; `None` picks the first socket-backed serial port.
    Serial(Option<String>),
    /// VNC display, optionally protected with a one-time ticket.
    Vnc(Option<Secret<String>>),
}

/// A console endpoint that passed every precondition check.
#[derive(Debug)]
pub struct ResolvedConsole {
    pub iface: String,
    pub socket: PathBuf,
}

pub struct ConsoleProxy {
    store: VmStore,
    policy: WaitPolicy,
    idle_timeout: Duration,
    monitor_timeout: Duration,
}

impl ConsoleProxy {
    pub fn new(
        store: VmStore,
        policy: WaitPolicy,
        idle_timeout: Duration,
        monitor_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            idle_timeout,
            monitor_timeout,
        }
    }

    /// Check configuration and run state, and compute the rendezvous path.
    pub fn resolve(&self, vmid: VmId, target: &ConsoleTarget) -> Result<ResolvedConsole> {
        let config = self.store.load(vmid)?;

        let iface = match target {
            ConsoleTarget::Serial(selector) => config.serial_socket(vmid, selector.as_deref())?,
            ConsoleTarget::Vnc(_) => {
                if !config.vnc {
                    return Err(Error::InterfaceNotConfigured {
                        vmid,
                        iface: "vnc".to_string(),
                    });
                }
                "vnc".to_string()
            }
        };

        self.store.ensure_running(vmid)?;

        Ok(ResolvedConsole {
            socket: self.store.socket_path(vmid, &iface),
            iface,
        })
    }

    /// Install the VNC ticket through the VM's management socket.
    fn install_ticket(&self, vmid: VmId, ticket: &Secret<String>) -> Result<()> {
        let mut client = QmpClient::connect(&self.store.qmp_socket(vmid), self.monitor_timeout)?;
        client.set_password("vnc", ticket.expose_secret())?;
        info!(vmid = %vmid, "VNC ticket installed");
        Ok(())
    }

    /// Attach stdin/stdout to the VM console until either side closes or the
    /// session goes idle.
    pub fn attach(
        &self,
        vmid: VmId,
        target: &ConsoleTarget,
    ) -> Result<(RelayOutcome, RelayStats)> {
        let console = self.resolve(vmid, target)?;

        if let ConsoleTarget::Vnc(Some(ticket)) = target {
            self.install_ticket(vmid, ticket)?;
        }

        let mut remote = SocketWaiter::new(self.policy).connect(&console.socket)?;
        let mut stdio = LocalStdio::open()?;

        info!(
            vmid = %vmid,
            iface = %console.iface,
            socket = %console.socket.display(),
            "console attached"
        );

        let relay = StreamRelay::new(self.idle_timeout);
        // Only the serial console is typed into by a human.
        let (relay, _raw) = match target {
            ConsoleTarget::Serial(_) => {
                eprintln!("attached to {} of VM {vmid}, press Ctrl+O to exit", console.iface);
                (relay.with_detach_byte(DETACH_KEY), RawModeGuard::enable())
            }
            ConsoleTarget::Vnc(_) => (relay, None),
        };
        let (outcome, stats) = relay.run(&mut stdio.input, &mut stdio.output, &mut remote)?;

        info!(vmid = %vmid, ?outcome, ?stats, "console detached");
        Ok((outcome, stats))
    }
}

/// Puts the controlling terminal in raw mode and restores it on drop.
pub struct RawModeGuard;

impl RawModeGuard {
    /// `None` when stdin is not a terminal or raw mode is unavailable.
    pub fn enable() -> Option<Self> {
        if !std::io::stdin().is_terminal() {
            return None;
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                warn!(error = %e, "failed to enable raw mode");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(dir: &std::path::Path) -> ConsoleProxy {
        ConsoleProxy::new(
            VmStore::new(dir, dir),
            WaitPolicy {
                retries: 0,
                interval: Duration::from_millis(1),
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    fn write_vm(dir: &std::path::Path, vmid: u32, config: &str, running: bool) {
        std::fs::write(dir.join(format!("{vmid}.yaml")), config).unwrap();
        if running {
            std::fs::write(dir.join(format!("{vmid}.pid")), std::process::id().to_string())
                .unwrap();
        }
    }

    #[test]
    fn unknown_vm_fails_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let vmid = VmId::new(200).unwrap();
        let err = proxy(dir.path())
            .resolve(vmid, &ConsoleTarget::Serial(None))
            .unwrap_err();
        assert!(matches!(err, Error::VmNotFound(_)));
    }

    #[test]
    fn stopped_vm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_vm(dir.path(), 201, "serial:\n  serial0: socket\n", false);
        let err = proxy(dir.path())
            .resolve(VmId::new(201).unwrap(), &ConsoleTarget::Serial(None))
            .unwrap_err();
        assert!(matches!(err, Error::VmNotRunning(_)));
    }

    #[test]
    fn vnc_must_be_enabled() {
        let dir = tempfile::tempdir().unwrap();
        write_vm(dir.path(), 202, "name: db\n", true);
        let err = proxy(dir.path())
            .resolve(VmId::new(202).unwrap(), &ConsoleTarget::Vnc(None))
            .unwrap_err();
        assert!(matches!(err, Error::InterfaceNotConfigured { ref iface, .. } if iface == "vnc"));
    }

    #[test]
    fn resolves_rendezvous_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_vm(dir.path(), 203, "vnc: true\nserial:\n  serial0: socket\n", true);
        let proxy = proxy(dir.path());
        let vmid = VmId::new(203).unwrap();

        let serial = proxy
            .resolve(vmid, &ConsoleTarget::Serial(Some("serial0".into())))
            .unwrap();
        assert_eq!(serial.iface, "serial0");
        assert_eq!(serial.socket, dir.path().join("203.serial0"));

        let vnc = proxy.resolve(vmid, &ConsoleTarget::Vnc(None)).unwrap();
        assert_eq!(vnc.socket, dir.path().join("203.vnc"));
    }

    #[test]
    fn missing_socket_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        write_vm(dir.path(), 204, "serial:\n  serial0: socket\n", true);
        let err = proxy(dir.path())
            .attach(VmId::new(204).unwrap(), &ConsoleTarget::Serial(None))
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
