//! Wire protocol for grid synchronization.
//!
//! Text frames carry a JSON envelope:
//! ```text
//! {"cmd":"SET","index":2,"value":"true"}
//! {"cmd":"REQUEST_SNAPSHOT"}
//! {"cmd":"SNAPSHOT","value":"0010"}
//! {"cmd":"ERROR","value":"Invalid JSON format"}
//! ```
//!
//! Cell values travel as the string literals `"true"` / `"false"` and
//! snapshots as one `'0'`/`'1'` character per cell. Both are kept for
//! compatibility with existing browser clients; decoding compares against
//! the literals and never coerces.
//!
//! Binary frames are the compact legacy encoding accepted by the server:
//! ```text
//! ┌──────────┬─────────────────────────┬──────────┐
//! │ command  │ index (24-bit, BE)      │ value    │
//! │ 1 byte   │ 3 bytes                 │ 1 byte   │
//! └──────────┴─────────────────────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CMD_SET: &str = "SET";
const CMD_REQUEST_SNAPSHOT: &str = "REQUEST_SNAPSHOT";
const CMD_SNAPSHOT: &str = "SNAPSHOT";
const CMD_ERROR: &str = "ERROR";

const VALUE_TRUE: &str = "true";
const VALUE_FALSE: &str = "false";

/// Size of a binary frame in bytes.
pub const FRAME_LEN: usize = 5;

/// Largest index a binary frame can address.
pub const MAX_FRAME_INDEX: u32 = 0x00FF_FFFF;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid binary frame: {0}")]
    InvalidFrame(String),
    #[error("Encode error: {0}")]
    Encode(String),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Set cell `index` to `value`.
    Set { index: usize, value: bool },
    /// Ask the server for the full grid.
    RequestSnapshot,
    /// Full grid, index order.
    Snapshot(Vec<bool>),
    /// Server-side complaint about the last frame.
    Error(String),
}

/// Inbound shape. Fields stay untyped so that range and literal checks
/// produce our own errors instead of serde coercions.
#[derive(Deserialize)]
struct Envelope {
    cmd: String,
    #[serde(default)]
    index: Option<serde_json::Value>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OutEnvelope<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Message {
    /// Shorthand for a `SET` message.
    pub fn set(index: usize, value: bool) -> Self {
        Self::Set { index, value }
    }

    /// Protocol command name.
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::Set { .. } => CMD_SET,
            Self::RequestSnapshot => CMD_REQUEST_SNAPSHOT,
            Self::Snapshot(_) => CMD_SNAPSHOT,
            Self::Error(_) => CMD_ERROR,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let (index, value) = match self {
            Self::Set { index, value } => (Some(*index), Some(encode_flag(*value).to_string())),
            Self::RequestSnapshot => (None, None),
            Self::Snapshot(cells) => (None, Some(encode_cells(cells))),
            Self::Error(reason) => (None, Some(reason.clone())),
        };
        let envelope = OutEnvelope {
            cmd: self.cmd(),
            index,
            value,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// Range checks against the grid size are left to the caller; this
    /// only guarantees that `index` is a non-negative integer.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;

        match envelope.cmd.as_str() {
            CMD_SET => Ok(Self::Set {
                index: parse_index(envelope.index)?,
                value: parse_flag(envelope.value)?,
            }),
            CMD_REQUEST_SNAPSHOT => Ok(Self::RequestSnapshot),
            CMD_SNAPSHOT => Ok(Self::Snapshot(parse_cells(envelope.value)?)),
            CMD_ERROR => {
                let reason = match envelope.value {
                    Some(serde_json::Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(Self::Error(reason))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn encode_flag(value: bool) -> &'static str {
    if value {
        VALUE_TRUE
    } else {
        VALUE_FALSE
    }
}

fn encode_cells(cells: &[bool]) -> String {
    cells.iter().map(|c| if *c { '1' } else { '0' }).collect()
}

fn parse_index(raw: Option<serde_json::Value>) -> Result<usize, ProtocolError> {
    let raw = raw.ok_or_else(|| ProtocolError::MalformedMessage("missing index".into()))?;
    raw.as_u64()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| ProtocolError::MalformedMessage(format!("invalid index: {raw}")))
}

fn parse_flag(raw: Option<serde_json::Value>) -> Result<bool, ProtocolError> {
    match raw {
        Some(serde_json::Value::String(s)) if s == VALUE_TRUE => Ok(true),
        Some(serde_json::Value::String(s)) if s == VALUE_FALSE => Ok(false),
        Some(other) => Err(ProtocolError::MalformedMessage(format!(
            "invalid value: {other}"
        ))),
        None => Err(ProtocolError::MalformedMessage("missing value".into())),
    }
}

fn parse_cells(raw: Option<serde_json::Value>) -> Result<Vec<bool>, ProtocolError> {
    let Some(serde_json::Value::String(bits)) = raw else {
        return Err(ProtocolError::MalformedMessage(
            "snapshot value must be a string".into(),
        ));
    };
    bits.chars()
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(ProtocolError::MalformedMessage(format!(
                "invalid snapshot character: {other:?}"
            ))),
        })
        .collect()
}

/// Binary frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCommand {
    Set = 0x01,
    Get = 0x02,
    Error = 0x03,
}

impl TryFrom<u8> for FrameCommand {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(FrameCommand::Set),
            0x02 => Ok(FrameCommand::Get),
            0x03 => Ok(FrameCommand::Error),
            other => Err(ProtocolError::InvalidFrame(format!(
                "invalid command byte 0x{other:02x}"
            ))),
        }
    }
}

/// Fixed 5-byte binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrame {
    pub command: FrameCommand,
    pub index: u32,
    pub value: bool,
}

impl BinaryFrame {
    pub fn set(index: u32, value: bool) -> Self {
        Self {
            command: FrameCommand::Set,
            index,
            value,
        }
    }

    /// Serialize to wire bytes. Indices wider than 24 bits are rejected.
    pub fn encode(&self) -> Result<[u8; FRAME_LEN], ProtocolError> {
        if self.index > MAX_FRAME_INDEX {
            return Err(ProtocolError::InvalidFrame(format!(
                "index {} does not fit in 24 bits",
                self.index
            )));
        }
        let [_, hi, mid, lo] = self.index.to_be_bytes();
        Ok([self.command as u8, hi, mid, lo, u8::from(self.value)])
    }

    /// Parse wire bytes. Any value byte other than 0x01 reads as unchecked.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: &[u8; FRAME_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidFrame(format!(
                "expected {FRAME_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let command = FrameCommand::try_from(bytes[0])?;
        let index = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            command,
            index,
            value: bytes[4] == 0x01,
        })
    }

    /// The equivalent text message, if the frame carries a mutation.
    pub fn to_message(&self) -> Option<Message> {
        match self.command {
            FrameCommand::Set => Some(Message::set(self.index as usize, self.value)),
            FrameCommand::Get | FrameCommand::Error => None,
        }
    }
}
