//! External tester text protocol.
//!
//! Frames are `STX TYPE (@key=value)* ETX` with `STX = 0x02` and
//! `ETX = 0x03`. A value that parses as JSON is decoded as structured data;
//! anything else is kept as a literal string. On the way out strings are
//! written raw and every other value as compact JSON.
//!
//! ```text
//! \x02ASK_REGISTER@TPNAME=SP-001@THICKNESS=2.41\x03
//! ```

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::driver::{HalResult, TesterLink};

/// Start of frame.
pub const STX: u8 = 0x02;
/// End of frame.
pub const ETX: u8 = 0x03;
/// Separator between message type and fields, and between fields.
pub const FIELD_SEP: char = '@';
/// Separator between a key and its value.
pub const KV_SEP: char = '=';
/// Longest frame the decoder buffers before giving up on it.
pub const MAX_FRAME_LEN: usize = 4096;

/// Wire protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame does not start with STX and end with ETX
    #[error("message is not framed by STX/ETX")]
    MissingEnvelope,

    /// Nothing between STX and the first field
    #[error("message type is empty")]
    EmptyType,

    /// Field without a key/value separator
    #[error("field {0:?} has no '=' separator")]
    MissingSeparator(String),

    /// Field with an empty key
    #[error("field {0:?} has an empty key")]
    EmptyKey(String),

    /// Text that cannot be placed in a frame
    #[error("cannot encode {what} {text:?}: contains a reserved character")]
    ReservedCharacter {
        /// "type", "key" or "value"
        what: &'static str,
        /// Offending text
        text: String,
    },

    /// Frame payload is not UTF-8
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Frame grew past [`MAX_FRAME_LEN`] without an ETX
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLong,
}

/// One decoded tester message.
#[derive(Debug, Clone, PartialEq)]
pub struct TesterMessage {
    /// Message type, e.g. `ARE_YOU_THERE`.
    pub kind: String,
    /// Keyword parameters.
    pub params: BTreeMap<String, Value>,
}

impl TesterMessage {
    /// Message without parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parameter by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// String parameter by key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Encode to a framed string.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        create_message(&self.kind, &self.params)
    }

    /// Parameters as a JSON object.
    pub fn params_json(&self) -> Value {
        Value::Object(self.params.clone().into_iter().collect())
    }
}

fn is_reserved(c: char) -> bool {
    c == FIELD_SEP || c == char::from(STX) || c == char::from(ETX)
}

fn check(what: &'static str, text: &str, extra: Option<char>) -> Result<(), ProtocolError> {
    if text.chars().any(|c| is_reserved(c) || Some(c) == extra) {
        return Err(ProtocolError::ReservedCharacter {
            what,
            text: text.to_string(),
        });
    }
    Ok(())
}

/// Frame a message.
///
/// `create_message("ARE_YOU_THERE", &BTreeMap::new())` yields
/// `"\x02ARE_YOU_THERE\x03"`.
pub fn create_message(kind: &str, params: &BTreeMap<String, Value>) -> Result<String, ProtocolError> {
    if kind.is_empty() {
        return Err(ProtocolError::EmptyType);
    }
    check("type", kind, None)?;

    let mut out = String::with_capacity(2 + kind.len() + params.len() * 16);
    out.push(char::from(STX));
    out.push_str(kind);
    for (key, value) in params {
        if key.is_empty() {
            return Err(ProtocolError::EmptyKey(String::new()));
        }
        check("key", key, Some(KV_SEP))?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        check("value", &text, None)?;
        out.push(FIELD_SEP);
        out.push_str(key);
        out.push(KV_SEP);
        out.push_str(&text);
    }
    out.push(char::from(ETX));
    Ok(out)
}

/// Parse one framed message. Exact inverse of [`create_message`].
pub fn parse_message(raw: &str) -> Result<TesterMessage, ProtocolError> {
    let inner = raw
        .strip_prefix(char::from(STX))
        .and_then(|s| s.strip_suffix(char::from(ETX)))
        .ok_or(ProtocolError::MissingEnvelope)?;

    let mut fields = inner.split(FIELD_SEP);
    let kind = fields.next().unwrap_or_default();
    if kind.is_empty() {
        return Err(ProtocolError::EmptyType);
    }

    let mut params = BTreeMap::new();
    for field in fields {
        let (key, text) = field
            .split_once(KV_SEP)
            .ok_or_else(|| ProtocolError::MissingSeparator(field.to_string()))?;
        if key.is_empty() {
            return Err(ProtocolError::EmptyKey(field.to_string()));
        }
        let value = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        params.insert(key.to_string(), value);
    }

    Ok(TesterMessage {
        kind: kind.to_string(),
        params,
    })
}

// ─── Stream framing ─────────────────────────────────────────────────

/// Splits a byte stream into frames.
///
/// Bytes outside an STX…ETX pair are discarded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Result<TesterMessage, ProtocolError>> {
        let Some(start) = self.buf.iter().position(|&b| b == STX) else {
            if !self.buf.is_empty() {
                trace!(bytes = self.buf.len(), "Discarding unframed bytes");
                self.buf.clear();
            }
            return None;
        };
        if start > 0 {
            trace!(bytes = start, "Discarding bytes before STX");
            self.buf.drain(..start);
        }

        // A later STX before ETX restarts the frame: only the last one
        // ahead of the terminator opens it.
        let end = self.buf.iter().skip(1).position(|&b| b == ETX).map(|i| i + 1);
        let open = self.buf[..end.unwrap_or(self.buf.len())]
            .iter()
            .rposition(|&b| b == STX)
            .unwrap_or(0);
        if open > 0 {
            warn!(bytes = open, "STX inside frame, dropping partial frame");
            self.buf.drain(..open);
        }

        let Some(end) = end.map(|end| end - open) else {
            if self.buf.len() > MAX_FRAME_LEN {
                self.buf.clear();
                return Some(Err(ProtocolError::FrameTooLong));
            }
            return None;
        };

        let frame: Vec<u8> = self.buf.drain(..=end).collect();
        Some(
            std::str::from_utf8(&frame)
                .map_err(|_| ProtocolError::InvalidUtf8)
                .and_then(parse_message),
        )
    }
}

// ─── Client ─────────────────────────────────────────────────────────

/// Message-level wrapper over a [`TesterLink`].
pub struct TesterClient {
    link: Box<dyn TesterLink>,
    decoder: FrameDecoder,
}

impl TesterClient {
    /// Wrap a link.
    pub fn new(link: Box<dyn TesterLink>) -> Self {
        Self {
            link,
            decoder: FrameDecoder::new(),
        }
    }

    /// (Re)connect, dropping any partially received frame.
    pub fn connect(&mut self) -> HalResult<()> {
        self.decoder = FrameDecoder::new();
        self.link.connect()
    }

    /// Send one message.
    pub fn send(&mut self, message: &TesterMessage) -> HalResult<()> {
        let frame = message.encode()?;
        debug!(kind = %message.kind, "Tester <- {}", frame.escape_debug());
        self.link.write(frame.as_bytes())
    }

    /// Next received message without blocking.
    pub fn poll(&mut self) -> HalResult<Option<TesterMessage>> {
        let bytes = self.link.read_available()?;
        self.decoder.push(&bytes);
        match self.decoder.next_frame() {
            Some(Ok(message)) => {
                debug!(kind = %message.kind, "Tester -> {:?}", message.params);
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for TesterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesterClient")
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}
