// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CAL wire format.
//!
//! Every message travels as a frame: a 12-byte big-endian header followed by
//! an ASCII body terminated by CRLF.
//!
//! ```text
//! +----------------+----------------+----------------+-------------------------+
//! | identity (u32) | unix secs (u32)| body len (u32) | body ... \r\n           |
//! +----------------+----------------+----------------+-------------------------+
//! ```
//!
//! The body starts with a single type character and carries tab-separated
//! fields, e.g. `E12:01:02.03\tURL\t/health\t0\tk=v\r\n`. The body builders in
//! this module produce unframed body text; [`pack`] turns a body into a
//! [`Frame`].

use std::fmt::Write as _;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, Timelike};

use crate::errors::CalError;
use crate::status::Status;

/// Length of the binary frame header.
pub const HEADER_LEN: usize = 12;

/// Longest body accepted before the CRLF terminator is appended.
pub const MAX_BODY_LEN: usize = 4094;

/// The collector reads the identity as a signed integer; the top bit must be clear.
pub const IDENTITY_MASK: u32 = 0x7FFF_FFFF;

const TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Event,
    StartTransaction,
    DataFragment,
    EndTransaction,
    AtomicTransaction,
    Sql,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Heartbeat,
        MessageKind::Event,
        MessageKind::StartTransaction,
        MessageKind::DataFragment,
        MessageKind::EndTransaction,
        MessageKind::AtomicTransaction,
        MessageKind::Sql,
    ];

    /// The leading body character that selects this kind on the wire.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            MessageKind::Heartbeat => b'H',
            MessageKind::Event => b'E',
            MessageKind::StartTransaction => b't',
            MessageKind::DataFragment => b'F',
            MessageKind::EndTransaction => b'T',
            MessageKind::AtomicTransaction => b'A',
            MessageKind::Sql => b'$',
        }
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        MessageKind::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Event => "event",
            MessageKind::StartTransaction => "start_transaction",
            MessageKind::DataFragment => "data_fragment",
            MessageKind::EndTransaction => "end_transaction",
            MessageKind::AtomicTransaction => "atomic_transaction",
            MessageKind::Sql => "sql",
        }
    }
}

impl FromStr for MessageKind {
    type Err = CalError;

    /// Accepts either the kind's name (`"event"`) or its wire tag (`"E"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let [tag] = s.as_bytes() {
            if let Some(kind) = MessageKind::from_tag(*tag) {
                return Ok(kind);
            }
        }
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| CalError::UnknownMessageKind(s.to_string()))
    }
}

/// Decoded form of the 12-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub identity: u32,
    pub timestamp: u32,
    pub body_len: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&(self.identity & IDENTITY_MASK).to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CalError> {
        let Some(header) = bytes.get(..HEADER_LEN) else {
            return Err(CalError::MalformedFrame(format!(
                "header needs {HEADER_LEN} bytes, have {}",
                bytes.len()
            )));
        };
        let word = |i: usize| {
            u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };
        Ok(FrameHeader {
            identity: word(0),
            timestamp: word(4),
            body_len: word(8),
        })
    }
}

/// One encoded message, header included. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw identity bytes, used to track per-connection handshakes.
    #[must_use]
    pub fn identity_tag(&self) -> [u8; 4] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }

    #[must_use]
    pub fn identity(&self) -> u32 {
        u32::from_be_bytes(self.identity_tag())
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Kind selected by the body's leading character, if it is a known one.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        self.body().first().copied().and_then(MessageKind::from_tag)
    }
}

/// Current local wall-clock time as `HH:MM:SS.cc`.
#[must_use]
pub fn timestamp() -> String {
    format_clock(&Local::now())
}

fn format_clock<T: Timelike>(time: &T) -> String {
    // leap seconds report more than 1e9 nanoseconds
    let centis = (time.nanosecond() / 10_000_000).min(99);
    format!(
        "{:02}:{:02}:{:02}.{:02}",
        time.hour(),
        time.minute(),
        time.second(),
        centis
    )
}

/// Milliseconds with two decimals, the unit collectors expect for durations.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}", duration.as_secs_f64() * 1000.0)
}

fn body(kind: MessageKind, fields: &[&str]) -> String {
    let ts = timestamp();
    let mut out = String::with_capacity(
        2 + ts.len() + fields.iter().map(|f| f.len() + 1).sum::<usize>() + TERMINATOR.len(),
    );
    out.push(kind.tag() as char);
    out.push_str(&ts);
    for field in fields {
        out.push('\t');
        out.push_str(field);
    }
    out.push_str(TERMINATOR);
    out
}

#[must_use]
pub fn heartbeat(cal_type: &str, name: &str, status: &Status, data: &str) -> String {
    body(MessageKind::Heartbeat, &[cal_type, name, status.as_str(), data])
}

#[must_use]
pub fn event(cal_type: &str, name: &str, status: &Status, data: &str) -> String {
    body(MessageKind::Event, &[cal_type, name, status.as_str(), data])
}

#[must_use]
pub fn start_transaction(cal_type: &str, name: &str) -> String {
    body(MessageKind::StartTransaction, &[cal_type, name])
}

#[must_use]
pub fn data_fragment(data: &str) -> String {
    let mut out = String::with_capacity(1 + data.len() + TERMINATOR.len());
    out.push(MessageKind::DataFragment.tag() as char);
    out.push_str(data);
    out.push_str(TERMINATOR);
    out
}

#[must_use]
pub fn end_transaction(
    cal_type: &str,
    name: &str,
    status: &Status,
    duration: &str,
    data: &str,
) -> String {
    body(
        MessageKind::EndTransaction,
        &[cal_type, name, status.as_str(), duration, data],
    )
}

#[must_use]
pub fn atomic_transaction(
    cal_type: &str,
    name: &str,
    status: &Status,
    duration: &str,
    data: &str,
) -> String {
    body(
        MessageKind::AtomicTransaction,
        &[cal_type, name, status.as_str(), duration, data],
    )
}

#[must_use]
pub fn sql(query: &str, hash: u32) -> String {
    format!("${hash}\t{query}{TERMINATOR}")
}

/// Frames `body` under `identity`.
///
/// A trailing CRLF is stripped and re-appended after escaping. Newlines are
/// escaped as `\n`/`\r` unless `escape_newlines` is false, non-ASCII characters
/// become backslash escapes, and the result is cut to [`MAX_BODY_LEN`] bytes.
#[must_use]
pub fn pack(body: &str, identity: u32, escape_newlines: bool) -> Frame {
    let body = body.strip_suffix(TERMINATOR).unwrap_or(body);

    let mut text = String::with_capacity(body.len() + TERMINATOR.len());
    for ch in body.chars() {
        match ch {
            '\n' if escape_newlines => text.push_str("\\n"),
            '\r' if escape_newlines => text.push_str("\\r"),
            c if c.is_ascii() => text.push(c),
            c => push_escaped(&mut text, c),
        }
    }

    let mut payload = text.into_bytes();
    payload.truncate(MAX_BODY_LEN);
    payload.extend_from_slice(TERMINATOR.as_bytes());

    let header = FrameHeader {
        identity,
        timestamp: unix_seconds(),
        body_len: payload.len() as u32,
    };

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(&payload);
    Frame { bytes }
}

fn push_escaped(out: &mut String, ch: char) {
    let code = ch as u32;
    // infallible: writing into a String
    let _ = if code <= 0xFF {
        write!(out, "\\x{code:02x}")
    } else if code <= 0xFFFF {
        write!(out, "\\u{code:04x}")
    } else {
        write!(out, "\\U{code:08x}")
    };
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// A frame decoded back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub header: FrameHeader,
    pub kind: MessageKind,
    /// Tab-separated body fields after the type character, terminator removed.
    ///
    /// The last field keeps any embedded tabs, so free-form data survives.
    pub fields: Vec<String>,
}

impl ParsedMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, CalError> {
        let header = FrameHeader::parse(bytes)?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != header.body_len as usize {
            return Err(CalError::MalformedFrame(format!(
                "header announces {} body bytes, have {}",
                header.body_len,
                body.len()
            )));
        }
        let Some(text) = body.strip_suffix(TERMINATOR.as_bytes()) else {
            return Err(CalError::MalformedFrame(
                "body does not end in CRLF".to_string(),
            ));
        };
        let Some((&tag, rest)) = text.split_first() else {
            return Err(CalError::MalformedFrame("empty body".to_string()));
        };
        let kind = MessageKind::from_tag(tag)
            .ok_or_else(|| CalError::UnknownMessageKind((tag as char).to_string()))?;
        let rest = std::str::from_utf8(rest)
            .map_err(|e| CalError::MalformedFrame(format!("body is not ASCII: {e}")))?;

        let max_fields = match kind {
            MessageKind::DataFragment => 1,
            MessageKind::Sql => 2,
            MessageKind::StartTransaction => 3,
            MessageKind::Heartbeat | MessageKind::Event => 5,
            MessageKind::EndTransaction | MessageKind::AtomicTransaction => 6,
        };
        let fields = rest.splitn(max_fields, '\t').map(str::to_string).collect();

        Ok(ParsedMessage {
            header,
            kind,
            fields,
        })
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}
