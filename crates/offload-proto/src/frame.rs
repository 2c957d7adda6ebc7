use std::marker::PhantomData;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Events a node writes onto a worker's event stream.
///
/// `Online` is emitted once per worker (plus a snapshot record at every
/// stream attach so a late reader learns current state). `Exit` and `Fault`
/// are terminal; nothing follows them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Online(bool),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Message(Vec<u8>),
    Exit(i32),
    Fault(FaultPayload),
}

/// Messages a client writes onto a worker's control stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Stdin(Vec<u8>),
    WorkerMessage(Vec<u8>),
    Terminate,
}

/// JSON envelope carried by a terminal `error` record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl FaultPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// Errors raised while decoding a frame stream.
///
/// Unknown record names are not errors; they are skipped for forward
/// compatibility. A malformed record of a recognized name is fatal for the
/// stream that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame record is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame record has no `name: value` separator: `{line}`")]
    MissingSeparator { line: String },
    #[error("invalid base64 payload in `{name}` record: {source}")]
    Payload {
        name: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("invalid exit code `{value}`")]
    ExitCode { value: String },
    #[error("invalid fault envelope: {source}")]
    Fault {
        #[source]
        source: serde_json::Error,
    },
}

/// A record type that can be framed as a `name ": " value` line.
pub trait Framed: Sized {
    fn encode(&self) -> String;

    /// Parses one record. `Ok(None)` means the name is not recognized and
    /// the line should be skipped.
    fn parse_record(name: &str, value: &str) -> Result<Option<Self>, FrameError>;
}

fn encode_line(name: &str, value: &str) -> String {
    let mut line = String::with_capacity(name.len() + value.len() + 3);
    line.push_str(name);
    line.push_str(": ");
    line.push_str(value);
    line.push('\n');
    line
}

fn decode_payload(name: &'static str, value: &str) -> Result<Vec<u8>, FrameError> {
    BASE64
        .decode(value)
        .map_err(|source| FrameError::Payload { name, source })
}

impl Framed for WorkerEvent {
    fn encode(&self) -> String {
        match self {
            WorkerEvent::Online(flag) => encode_line("online", if *flag { "true" } else { "false" }),
            WorkerEvent::Stdout(bytes) => encode_line("stdout", &BASE64.encode(bytes)),
            WorkerEvent::Stderr(bytes) => encode_line("stderr", &BASE64.encode(bytes)),
            WorkerEvent::Message(bytes) => encode_line("message", &BASE64.encode(bytes)),
            WorkerEvent::Exit(code) => encode_line("exit", &code.to_string()),
            WorkerEvent::Fault(fault) => {
                let json = serde_json::json!({
                    "name": fault.name,
                    "message": fault.message,
                    "stack": fault.stack,
                })
                .to_string();
                encode_line("error", &BASE64.encode(json.as_bytes()))
            }
        }
    }

    fn parse_record(name: &str, value: &str) -> Result<Option<Self>, FrameError> {
        match name {
            "online" => Ok(Some(WorkerEvent::Online(value == "true"))),
            "stdout" => Ok(Some(WorkerEvent::Stdout(decode_payload("stdout", value)?))),
            "stderr" => Ok(Some(WorkerEvent::Stderr(decode_payload("stderr", value)?))),
            "message" => Ok(Some(WorkerEvent::Message(decode_payload(
                "message", value,
            )?))),
            "exit" => {
                let code = value.parse::<i32>().map_err(|_| FrameError::ExitCode {
                    value: value.to_string(),
                })?;
                Ok(Some(WorkerEvent::Exit(code)))
            }
            "error" => {
                let raw = decode_payload("error", value)?;
                let fault = serde_json::from_slice(&raw)
                    .map_err(|source| FrameError::Fault { source })?;
                Ok(Some(WorkerEvent::Fault(fault)))
            }
            _ => Ok(None),
        }
    }
}

impl Framed for ControlMessage {
    fn encode(&self) -> String {
        match self {
            ControlMessage::Stdin(bytes) => encode_line("stdin", &BASE64.encode(bytes)),
            ControlMessage::WorkerMessage(bytes) => {
                encode_line("worker_message", &BASE64.encode(bytes))
            }
            ControlMessage::Terminate => encode_line("terminate", "true"),
        }
    }

    fn parse_record(name: &str, value: &str) -> Result<Option<Self>, FrameError> {
        match name {
            "stdin" => Ok(Some(ControlMessage::Stdin(decode_payload("stdin", value)?))),
            "worker_message" => Ok(Some(ControlMessage::WorkerMessage(decode_payload(
                "worker_message",
                value,
            )?))),
            "terminate" => Ok(Some(ControlMessage::Terminate)),
            _ => Ok(None),
        }
    }
}

/// Incremental decoder over an arbitrarily chunked frame stream.
///
/// Chunks are split on `\n`; the first fragment of a chunk is appended to
/// whatever the previous chunk left behind, and the trailing fragment is
/// carried forward until the next `\n` arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder<T> {
    pending: Vec<u8>,
    _record: PhantomData<T>,
}

impl<T: Framed> FrameDecoder<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            _record: PhantomData,
        }
    }

    /// Feeds one chunk and returns every record completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<T>, FrameError> {
        self.pending.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            let line = &self.pending[consumed..end];
            consumed = end + 1;
            if let Some(record) = parse_frame_line(line)? {
                records.push(record);
            }
        }
        self.pending.drain(..consumed);
        Ok(records)
    }

    /// True when a partial record is still buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn parse_frame_line<T: Framed>(raw: &[u8]) -> Result<Option<T>, FrameError> {
    let line = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let (name, value) = line
        .split_once(": ")
        .ok_or_else(|| FrameError::MissingSeparator {
            line: line.to_string(),
        })?;
    T::parse_record(name, value)
}
