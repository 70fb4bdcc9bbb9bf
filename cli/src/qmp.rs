//! Minimal synchronous QMP client for a VM's management socket.
//!
//! QMP is newline-delimited JSON: the server greets, the client negotiates
//! capabilities, then every `execute` is answered by exactly one `return` or
//! `error` object. Asynchronous `event` objects may arrive at any time and
//! are skipped.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("failed to connect to {path}: {source}")]
    Connect { path: String, source: io::Error },

    #[error("I/O error on management socket: {0}")]
    Io(#[from] io::Error),

    #[error("malformed reply: {0}")]
    Protocol(String),

    #[error("{desc}")]
    Command { class: String, desc: String },

    #[error("management socket closed the connection")]
    Closed,
}

#[derive(Serialize)]
struct Request<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    class: String,
    desc: String,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum Message {
    Return {
        #[serde(rename = "return")]
        value: Value,
    },
    Error {
        error: ErrorBody,
    },
    Event {
        event: String,
    },
    Greeting {
        #[serde(rename = "QMP")]
        _info: Value,
    },
}

pub struct QmpClient<S> {
    reader: BufReader<S>,
    writer: S,
}

impl QmpClient<UnixStream> {
    /// Connect to `path`, read the greeting and leave negotiation mode.
    pub fn connect(path: &Path, timeout: Duration) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).map_err(|source| QmpError::Connect {
            path: path.display().to_string(),
            source,
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let writer = stream.try_clone()?;
        let mut client = Self::new(stream, writer);
        client.handshake()?;
        Ok(client)
    }
}

impl<S> QmpClient<S>
where
    S: io::Read + Write,
{
    pub fn new(reader: S, writer: S) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    fn handshake(&mut self) -> Result<(), QmpError> {
        match self.read_message()? {
            Message::Greeting { .. } => {}
            other => {
                return Err(QmpError::Protocol(format!(
                    "expected greeting, got {other:?}"
                )));
            }
        }
        self.execute("qmp_capabilities", None)?;
        debug!("QMP capabilities negotiated");
        Ok(())
    }

    fn read_message(&mut self) -> Result<Message, QmpError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(QmpError::Closed);
        }
        serde_json::from_str(line.trim_end()).map_err(|e| QmpError::Protocol(e.to_string()))
    }

    /// Run one QMP command and return its `return` value.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let request = Request {
            execute: command,
            arguments,
        };
        let mut payload =
            serde_json::to_vec(&request).map_err(|e| QmpError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        self.writer.write_all(&payload)?;
        self.writer.flush()?;

        loop {
            match self.read_message()? {
                Message::Return { value } => return Ok(value),
                Message::Error { error } => {
                    return Err(QmpError::Command {
                        class: error.class,
                        desc: error.desc,
                    });
                }
                Message::Event { event } => trace!(%event, "skipping QMP event"),
                Message::Greeting { .. } => {
                    return Err(QmpError::Protocol("unexpected greeting".into()));
                }
            }
        }
    }

    /// Execute a human monitor command line and return its text output.
    pub fn human_monitor_command(&mut self, command_line: &str) -> Result<String, QmpError> {
        let value = self.execute(
            "human-monitor-command",
            Some(serde_json::json!({ "command-line": command_line })),
        )?;
        match value {
            Value::String(text) => Ok(text),
            other => Err(QmpError::Protocol(format!(
                "expected string reply, got {other}"
            ))),
        }
    }

    /// Set the password a display protocol (e.g. `vnc`) accepts.
    pub fn set_password(&mut self, protocol: &str, password: &str) -> Result<(), QmpError> {
        self.execute(
            "set_password",
            Some(serde_json::json!({ "protocol": protocol, "password": password })),
        )?;
        Ok(())
    }
}
