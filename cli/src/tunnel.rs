//! Control channel that gates a migration tunnel.
//!
//! The peer waits for a single status line, then keeps the channel open until
//! it sends `quit` or closes its end. Nothing else on the channel means
//! anything.

use std::io::{BufRead, Write};

use tracing::{debug, info};

use crate::errors::Result;
use crate::quorum::QuorumCheck;

pub const NO_QUORUM: &str = "no quorum";
pub const TUNNEL_ONLINE: &str = "tunnel online";
pub const QUIT: &str = "quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    NoQuorum,
    Quit,
    EndOfInput,
}

pub struct ControlTunnel<Q> {
    quorum: Q,
}

impl<Q: QuorumCheck> ControlTunnel<Q> {
    pub fn new(quorum: Q) -> Self {
        Self { quorum }
    }

    pub fn run<R, W>(&self, input: &mut R, output: &mut W) -> Result<TunnelOutcome>
    where
        R: BufRead,
        W: Write,
    {
        if !self.quorum.has_quorum()? {
            writeln!(output, "{NO_QUORUM}")?;
            output.flush()?;
            info!("tunnel refused, node has no quorum");
            return Ok(TunnelOutcome::NoQuorum);
        }

        writeln!(output, "{TUNNEL_ONLINE}")?;
        output.flush()?;
        info!("tunnel online");

        let mut line = String::new();
        let mut discarded = 0usize;
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                debug!(discarded, "tunnel input closed");
                return Ok(TunnelOutcome::EndOfInput);
            }

            if line.strip_suffix('\n').unwrap_or(&line) == QUIT {
                debug!(discarded, "tunnel quit requested");
                return Ok(TunnelOutcome::Quit);
            }
            discarded += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use std::io::{BufReader, Cursor, Read};

    struct Fixed(bool);

    impl QuorumCheck for Fixed {
        fn has_quorum(&self) -> Result<bool> {
            Ok(self.0)
        }
    }

    struct Broken;

    impl QuorumCheck for Broken {
        fn has_quorum(&self) -> Result<bool> {
            Err(Error::PreconditionCheck("cluster filesystem unavailable".into()))
        }
    }

    #[test]
    fn no_quorum_consumes_nothing() {
        let mut input = Cursor::new(b"quit\n".to_vec());
        let mut output = Vec::new();
        let outcome = ControlTunnel::new(Fixed(false))
            .run(&mut input, &mut output)
            .unwrap();

        assert_eq!(outcome, TunnelOutcome::NoQuorum);
        assert_eq!(output, b"no quorum\n");
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn discards_lines_until_quit() {
        let mut input = Cursor::new(b"hello\nworld\nquit\nafter\n".to_vec());
        let mut output = Vec::new();
        let outcome = ControlTunnel::new(Fixed(true))
            .run(&mut input, &mut output)
            .unwrap();

        assert_eq!(outcome, TunnelOutcome::Quit);
        assert_eq!(output, b"tunnel online\n");

        let mut rest = String::new();
        input.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "after\n");
    }

    #[test]
    fn quit_is_case_sensitive_and_exact() {
        let mut input = BufReader::new(&b"QUIT\n quit\nquit \n"[..]);
        let mut output = Vec::new();
        let outcome = ControlTunnel::new(Fixed(true))
            .run(&mut input, &mut output)
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::EndOfInput);
    }

    #[test]
    fn quit_without_newline_at_eof() {
        let mut input = Cursor::new(b"quit".to_vec());
        let mut output = Vec::new();
        let outcome = ControlTunnel::new(Fixed(true))
            .run(&mut input, &mut output)
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::Quit);
    }

    #[test]
    fn end_of_input_is_normal() {
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let outcome = ControlTunnel::new(Fixed(true))
            .run(&mut input, &mut output)
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::EndOfInput);
        assert_eq!(output, b"tunnel online\n");
    }

    #[test]
    fn failing_quorum_check_is_fatal() {
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let err = ControlTunnel::new(Broken)
            .run(&mut input, &mut output)
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionCheck(_)));
        assert!(output.is_empty());
    }
}
