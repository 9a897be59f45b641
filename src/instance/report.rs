//! # Inbound delivery reports.
//!
//! A connection opens with the browser's report of what it received so far:
//!
//! ```text
//! {"gaps": [[2, 4], [7]], "results": {"1": null, "5": "boom", "6": [{"x": 1}, null]}}
//! ```
//!
//! - `gaps`: inclusive ranges that never arrived intact; `[s]` means `[s, s]`.
//! - `results`: per sequence number, `null` (success), an error string, or an
//!   `[output, error]` pair.
//!
//! Both fields are optional.
//!
//! The event-sender transport acknowledges with a [`CallResponse`] instead:
//! `{"ack": 12, "results": {...}}`, where `ack` is the last sequence number
//! the browser received.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{CallError, ReportError};

use super::CallResult;

/// Inclusive range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

impl Gap {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Parsed delivery report.
#[derive(Debug, Default)]
pub struct Report {
    /// Ranges to resend or skip, in the order the peer sent them.
    pub gaps: Vec<Gap>,
    /// Results by sequence number.
    pub results: BTreeMap<u64, CallResult>,
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    gaps: Vec<Vec<u64>>,
    #[serde(default)]
    results: BTreeMap<u64, Value>,
}

impl Report {
    /// Parses a report body.
    ///
    /// # Example
    /// ```
    /// use doorframe::{Gap, Report};
    ///
    /// let report = Report::parse(br#"{"gaps":[[3]],"results":{"1":null,"2":"nope"}}"#).unwrap();
    /// assert_eq!(report.gaps, vec![Gap::new(3, 3)]);
    /// assert!(report.results[&1].is_ok());
    /// assert!(report.results[&2].is_err());
    /// ```
    pub fn parse(body: &[u8]) -> Result<Self, ReportError> {
        let raw: RawReport = serde_json::from_slice(body)?;
        let gaps = raw
            .gaps
            .into_iter()
            .map(|g| match g.as_slice() {
                [s] => Ok(Gap::new(*s, *s)),
                [s, e] => Ok(Gap::new(*s, *e)),
                other => Err(ReportError::GapShape { len: other.len() }),
            })
            .collect::<Result<_, _>>()?;
        let results = raw
            .results
            .into_iter()
            .map(|(seq, v)| result(seq, v).map(|r| (seq, r)))
            .collect::<Result<_, _>>()?;
        Ok(Self { gaps, results })
    }

    /// Builds a report with results only.
    pub fn with_results(results: impl IntoIterator<Item = (u64, CallResult)>) -> Self {
        Self {
            gaps: Vec::new(),
            results: results.into_iter().collect(),
        }
    }
}

/// Acknowledgement posted by the browser on the event-sender transport.
#[derive(Debug, Default)]
pub struct CallResponse {
    pub ack: u64,
    pub results: BTreeMap<u64, CallResult>,
}

#[derive(Deserialize)]
struct RawResponse {
    ack: u64,
    #[serde(default)]
    results: BTreeMap<u64, Value>,
}

impl CallResponse {
    pub fn parse(body: &[u8]) -> Result<Self, ReportError> {
        let raw: RawResponse = serde_json::from_slice(body)?;
        let results = raw
            .results
            .into_iter()
            .map(|(seq, v)| result(seq, v).map(|r| (seq, r)))
            .collect::<Result<_, _>>()?;
        Ok(Self { ack: raw.ack, results })
    }
}

fn remote(message: String) -> CallError {
    CallError::Remote { message }
}

fn result(seq: u64, v: Value) -> Result<CallResult, ReportError> {
    match v {
        Value::Null => Ok(Ok(None)),
        Value::String(message) => Ok(Err(remote(message))),
        Value::Array(pair) if pair.len() == 2 => {
            let mut pair = pair.into_iter();
            let output = pair.next().unwrap_or(Value::Null);
            match pair.next().unwrap_or(Value::Null) {
                Value::Null if output.is_null() => Ok(Ok(None)),
                Value::Null => Ok(Ok(Some(output))),
                Value::String(message) => Ok(Err(remote(message))),
                _ => Err(ReportError::ResultShape { seq }),
            }
        }
        _ => Err(ReportError::ResultShape { seq }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full() {
        let report = Report::parse(
            br#"{"gaps":[[2,4],[7]],"results":{"1":null,"5":"boom","6":[{"x":1},null],"8":[null,"bad"]}}"#,
        )
        .unwrap();
        assert_eq!(report.gaps, vec![Gap::new(2, 4), Gap::new(7, 7)]);
        assert_eq!(report.results[&1], Ok(None));
        assert_eq!(report.results[&5], Err(remote("boom".into())));
        assert_eq!(report.results[&6], Ok(Some(json!({"x": 1}))));
        assert_eq!(report.results[&8], Err(remote("bad".into())));
    }

    #[test]
    fn test_parse_empty_and_errors() {
        let report = Report::parse(b"{}").unwrap();
        assert!(report.gaps.is_empty() && report.results.is_empty());

        assert!(matches!(Report::parse(b"{"), Err(ReportError::Malformed(_))));
        assert!(matches!(
            Report::parse(br#"{"gaps":[[1,2,3]]}"#),
            Err(ReportError::GapShape { len: 3 })
        ));
        assert!(matches!(
            Report::parse(br#"{"gaps":[[]]}"#),
            Err(ReportError::GapShape { len: 0 })
        ));
        assert!(matches!(
            Report::parse(br#"{"results":{"4":12}}"#),
            Err(ReportError::ResultShape { seq: 4 })
        ));
    }

    #[test]
    fn test_parse_call_response() {
        let resp = CallResponse::parse(br#"{"ack":4,"results":{"3":[1,null]}}"#).unwrap();
        assert_eq!(resp.ack, 4);
        assert_eq!(resp.results[&3], Ok(Some(json!(1))));
        assert!(CallResponse::parse(br#"{"results":{}}"#).is_err());
    }
}
