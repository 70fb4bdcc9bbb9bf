use std::process::{Command, Stdio};

use tracing::debug;

use crate::errors::{Error, Result};

/// Cluster quorum predicate consulted before a tunnel is opened.
pub trait QuorumCheck {
    fn has_quorum(&self) -> Result<bool>;
}

/// A node that is not part of a cluster always has quorum.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl QuorumCheck for Standalone {
    fn has_quorum(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Asks an external tool; a zero exit status means the node is quorate.
#[derive(Debug, Clone)]
pub struct CommandQuorum {
    program: String,
    args: Vec<String>,
}

impl CommandQuorum {
    /// Build from an argv list; `None` when the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl QuorumCheck for CommandQuorum {
    fn has_quorum(&self) -> Result<bool> {
        // The tool's output must not leak into the tunnel's stdout.
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::PreconditionCheck(format!("{}: {e}", self.program)))?;

        debug!(program = %self.program, ?status, "quorum check finished");
        Ok(status.success())
    }
}

impl<Q: QuorumCheck + ?Sized> QuorumCheck for Box<Q> {
    fn has_quorum(&self) -> Result<bool> {
        (**self).has_quorum()
    }
}
