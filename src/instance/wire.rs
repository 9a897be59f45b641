//! # Wire framing of outbound units.
//!
//! ```text
//! unit   := len:u32be header:json payload:bytes 0xFF
//! signal := 00 00 00 00 code:u8
//!
//! header := [end]                    filler of one
//!         | [end, start]             filler range
//!         | [end, name, arg]         call
//!         | [end, start, name, arg]  call; start..end-1 were skipped
//! ```
//!
//! Payloads are UTF-8 and never contain `0xFF`.

use serde_json::{Value, json};

use super::CallData;

pub(crate) const TERMINATOR: u8 = 0xFF;

/// Out-of-band connection signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Reconnect with a fresh report.
    Roll = 0x00,
    /// The instance was suspended; the page should stop.
    Suspend = 0x01,
    /// The instance was killed; the page should reload.
    Kill = 0x02,
}

impl Signal {
    pub(crate) fn encode(self) -> [u8; 5] {
        [0, 0, 0, 0, self as u8]
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Signal::Roll => "roll",
            Signal::Suspend => "suspend",
            Signal::Kill => "kill",
        }
    }
}

fn range(start: u64, end: u64) -> Vec<Value> {
    if start == end {
        vec![json!(end)]
    } else {
        vec![json!(end), json!(start)]
    }
}

fn frame(header: &[Value], payload: &[u8]) -> Vec<u8> {
    // Serializing a slice of values cannot fail.
    let header = serde_json::to_vec(header).unwrap_or_default();
    let len = u32::try_from(header.len()).unwrap_or(u32::MAX);
    let mut buf = Vec::with_capacity(4 + header.len() + payload.len() + 1);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    buf.push(TERMINATOR);
    buf
}

/// Unit telling the peer that `start..=end` carry nothing.
pub(crate) fn filler(start: u64, end: u64) -> Vec<u8> {
    frame(&range(start, end), &[])
}

/// Unit delivering `data` as sequence `end`, skipping `start..end`.
pub(crate) fn call(start: u64, end: u64, data: &CallData) -> Vec<u8> {
    let mut header = range(start, end);
    header.push(json!(data.name));
    header.push(data.arg.clone());
    frame(&header, &data.payload)
}

/// A decoded unit, as the browser sees it.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Unit {
    Filler {
        start: u64,
        end: u64,
    },
    Call {
        start: u64,
        end: u64,
        name: String,
        arg: Value,
        payload: Vec<u8>,
    },
    Signal(u8),
}

#[cfg(test)]
impl Unit {
    /// `(start, end, first arg element)` for compact assertions.
    pub(crate) fn summary(&self) -> (u64, u64, Option<Value>) {
        match self {
            Unit::Filler { start, end } => (*start, *end, None),
            Unit::Call { start, end, arg, .. } => (*start, *end, arg.get(0).cloned()),
            Unit::Signal(code) => (0, 0, Some(json!(code))),
        }
    }
}

/// Decodes a byte stream into units. Panics on malformed input.
#[cfg(test)]
pub(crate) fn parse(mut buf: &[u8]) -> Vec<Unit> {
    let mut units = Vec::new();
    while !buf.is_empty() {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        buf = &buf[4..];
        if len == 0 {
            units.push(Unit::Signal(buf[0]));
            buf = &buf[1..];
            continue;
        }
        let header: Vec<Value> = serde_json::from_slice(&buf[..len]).expect("header json");
        buf = &buf[len..];
        let stop = buf.iter().position(|b| *b == TERMINATOR).expect("terminator");
        let payload = buf[..stop].to_vec();
        buf = &buf[stop + 1..];
        let num = |v: &Value| v.as_u64().expect("seq");
        let end = num(&header[0]);
        let unit = match header.len() {
            1 => Unit::Filler { start: end, end },
            2 => Unit::Filler {
                start: num(&header[1]),
                end,
            },
            3 => Unit::Call {
                start: end,
                end,
                name: header[1].as_str().expect("name").to_string(),
                arg: header[2].clone(),
                payload,
            },
            4 => Unit::Call {
                start: num(&header[1]),
                end,
                name: header[2].as_str().expect("name").to_string(),
                arg: header[3].clone(),
                payload,
            },
            n => panic!("header of {n} elements"),
        };
        units.push(unit);
    }
    units
}
