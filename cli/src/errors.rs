use std::path::PathBuf;

use crate::vm::VmId;

/// Fatal errors of the relay, tunnel and monitor operations.
///
/// Everything here terminates the invocation with a non-zero exit status.
/// Expected terminal states (EOF, idle timeout, missing quorum) are reported
/// as outcomes, not errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("VM {0} does not exist")]
    VmNotFound(VmId),

    #[error("VM {0} is not running")]
    VmNotRunning(VmId),

    #[error("interface '{iface}' is not configured for VM {vmid}")]
    InterfaceNotConfigured { vmid: VmId, iface: String },

    #[error("interface '{iface}' of VM {vmid} is not a socket (mode: {mode})")]
    InterfaceWrongType {
        vmid: VmId,
        iface: String,
        mode: String,
    },

    #[error("invalid configuration for VM {vmid}: {reason}")]
    InvalidConfig { vmid: VmId, reason: String },

    #[error("unable to connect to {}: {reason}", path.display())]
    Connection { path: PathBuf, reason: String },

    #[error("precondition check failed: {0}")]
    PreconditionCheck(String),

    #[error("management endpoint error: {0}")]
    Monitor(#[from] crate::qmp::QmpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
