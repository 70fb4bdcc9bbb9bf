//! VM resolution for the relay operations.
//!
//! A VM is known to this node when `<config_dir>/<vmid>.yaml` exists. Its
//! hypervisor process writes `<runtime_dir>/<vmid>.pid` and owns the
//! rendezvous sockets `<runtime_dir>/<vmid>.<interface>`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{Error, Result};

/// Integer handle of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(u32);

impl VmId {
    pub fn new(id: u32) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VmId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("'{s}' is not a valid VM id"))?;
        VmId::new(id).ok_or_else(|| "VM id must be greater than zero".to_string())
    }
}

/// Serial console mode, same vocabulary as the hypervisor console config.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleMode {
    Off,
    Pty,
    Tty,
    File,
    Socket,
    Null,
}

impl fmt::Display for ConsoleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsoleMode::Off => "off",
            ConsoleMode::Pty => "pty",
            ConsoleMode::Tty => "tty",
            ConsoleMode::File => "file",
            ConsoleMode::Socket => "socket",
            ConsoleMode::Null => "null",
        };
        f.write_str(s)
    }
}

/// The parts of a VM configuration the relay operations care about.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct VmConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub vnc: bool,
    #[serde(default)]
    pub serial: BTreeMap<String, ConsoleMode>,
}

impl VmConfig {
    /// Pick the serial interface to attach to.
    ///
    /// Without a selector the first socket-mode interface in name order wins.
    pub fn serial_socket(&self, vmid: VmId, iface: Option<&str>) -> Result<String> {
        match iface {
            Some(iface) => {
                let mode = self.serial.get(iface).ok_or_else(|| Error::InterfaceNotConfigured {
                    vmid,
                    iface: iface.to_string(),
                })?;
                if *mode != ConsoleMode::Socket {
                    return Err(Error::InterfaceWrongType {
                        vmid,
                        iface: iface.to_string(),
                        mode: mode.to_string(),
                    });
                }
                Ok(iface.to_string())
            }
            None => self
                .serial
                .iter()
                .find(|(_, mode)| **mode == ConsoleMode::Socket)
                .map(|(name, _)| name.clone())
                .ok_or_else(|| Error::InterfaceNotConfigured {
                    vmid,
                    iface: "serial".to_string(),
                }),
        }
    }
}

/// Read-only view of the node's VM configuration and runtime directories.
#[derive(Debug, Clone)]
pub struct VmStore {
    config_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl VmStore {
    pub fn new(config_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    fn config_path(&self, vmid: VmId) -> PathBuf {
        self.config_dir.join(format!("{vmid}.yaml"))
    }

    /// Load the configuration of `vmid`; a missing file means the VM does not exist.
    pub fn load(&self, vmid: VmId) -> Result<VmConfig> {
        let path = self.config_path(vmid);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::VmNotFound(vmid));
            }
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() {
            return Ok(VmConfig::default());
        }

        serde_yaml::from_str(&contents).map_err(|e| Error::InvalidConfig {
            vmid,
            reason: e.to_string(),
        })
    }

    /// Rendezvous socket path of `iface` for `vmid`.
    pub fn socket_path(&self, vmid: VmId, iface: &str) -> PathBuf {
        self.runtime_dir.join(format!("{vmid}.{iface}"))
    }

    pub fn qmp_socket(&self, vmid: VmId) -> PathBuf {
        self.socket_path(vmid, "qmp")
    }

    fn pid_path(&self, vmid: VmId) -> PathBuf {
        self.socket_path(vmid, "pid")
    }

    /// PID of the running hypervisor process, if any.
    pub fn running_pid(&self, vmid: VmId) -> Option<i32> {
        let raw = std::fs::read_to_string(self.pid_path(vmid)).ok()?;
        let pid = raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)?;

        // EPERM still proves the process exists.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => Some(pid),
            Err(e) => {
                debug!(vmid = %vmid, pid, error = %e, "stale pid file");
                None
            }
        }
    }

    pub fn ensure_running(&self, vmid: VmId) -> Result<i32> {
        self.running_pid(vmid).ok_or(Error::VmNotRunning(vmid))
    }
}
