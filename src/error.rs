//! Error types used by the scheduler, the outbox and the tracker layer.
//!
//! Expected races (a cancelled scope, a killed thread, a suspended door) are not
//! errors: operations report them with `bool`, `Option` or a closed completion.
//! The enums below cover the remaining failures:
//!
//! - [`DeckError`]: protocol integrity violations and queue exhaustion in the outbox.
//! - [`ReportError`]: an inbound report that is not valid JSON of the expected shape.
//! - [`ConnectError`]: a transport connection that could not be attached to an instance.
//! - [`CallError`]: the outcome of an outbound call that did not succeed.
//! - [`RenderError`]: content that failed to render.
//! - [`DoorError`]: a door operation whose render or patch failed.
//! - [`HookError`]: a browser-originated hook request that could not be served.
//! - [`RuntimeError`]: failures of the runtime itself.
//!
//! Every type provides `as_label` (stable snake_case label for logs) and `as_message`.

use thiserror::Error;

/// # Errors produced by the outbox deck.
///
/// Everything except [`DeckError::QueueLimit`] means the peer sent a report that
/// contradicts what the deck has issued; the connection is treated as corrupted.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeckError {
    /// The deck already holds `limit` sequence numbers.
    #[error("queue limit {limit} reached")]
    QueueLimit {
        /// Configured queue limit.
        limit: usize,
    },

    /// A result references a sequence number that was never assigned.
    #[error("result for seq {seq} beyond last seq {last}")]
    ResultOverflow { seq: u64, last: u64 },

    /// A result references a call that is still waiting to be written.
    #[error("result for seq {seq} which was not issued")]
    NotIssued { seq: u64 },

    /// A gap reaches the last assigned sequence number or beyond.
    #[error("gap end {end} is not below last seq {last}")]
    GapOverflow { end: u64, last: u64 },

    /// A gap starts at or before an already reported result.
    #[error("gap start {start} overlaps reported seq {reported}")]
    GapBehindResult { start: u64, reported: u64 },

    /// A gap with its end before its start.
    #[error("gap [{start}, {end}] is inverted")]
    GapInverted { start: u64, end: u64 },

    /// Two gaps overlap or are not in increasing order.
    #[error("gap starting at {start} overlaps previous gap ending at {prev_end}")]
    GapOverlap { start: u64, prev_end: u64 },

    /// A restored card collides with one already in the deck.
    #[error("card for seq {seq} overlaps an existing card")]
    CardOverlap { seq: u64 },
}

impl DeckError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use doorframe::DeckError;
    ///
    /// let err = DeckError::QueueLimit { limit: 8 };
    /// assert_eq!(err.as_label(), "deck_queue_limit");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            DeckError::QueueLimit { .. } => "deck_queue_limit",
            DeckError::ResultOverflow { .. } => "deck_result_overflow",
            DeckError::NotIssued { .. } => "deck_not_issued",
            DeckError::GapOverflow { .. } => "deck_gap_overflow",
            DeckError::GapBehindResult { .. } => "deck_gap_behind_result",
            DeckError::GapInverted { .. } => "deck_gap_inverted",
            DeckError::GapOverlap { .. } => "deck_gap_overlap",
            DeckError::CardOverlap { .. } => "deck_card_overlap",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// True for errors that indicate a corrupted or malicious report.
    pub fn is_integrity(&self) -> bool {
        !matches!(self, DeckError::QueueLimit { .. })
    }
}

/// # Malformed inbound report.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReportError {
    /// The body is not a valid report document.
    #[error("malformed report: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A gap entry with neither one nor two bounds.
    #[error("gap must hold one or two bounds, got {len}")]
    GapShape { len: usize },

    /// A result that is neither `null`, an error string nor an `[output, error]` pair.
    #[error("result for seq {seq} has an unexpected shape")]
    ResultShape { seq: u64 },
}

impl ReportError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ReportError::Malformed(_) => "report_malformed",
            ReportError::GapShape { .. } => "report_gap_shape",
            ReportError::ResultShape { .. } => "report_result_shape",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors returned when attaching a transport connection.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The request body could not be parsed; the instance is unaffected.
    #[error("bad request: {0}")]
    BadRequest(#[from] ReportError),

    /// The report contradicts the deck; the instance has been ended.
    #[error("sync error: {0}")]
    Sync(#[from] DeckError),

    /// The instance has already ended (or never existed).
    #[error("instance is gone")]
    Gone,

    /// The instance uses a different transport.
    #[error("instance does not use the {expected} transport")]
    WrongTransport { expected: &'static str },
}

impl ConnectError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConnectError::BadRequest(_) => "connect_bad_request",
            ConnectError::Sync(_) => "connect_sync_error",
            ConnectError::Gone => "connect_gone",
            ConnectError::WrongTransport { .. } => "connect_wrong_transport",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Unsuccessful outcome of an outbound call.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The browser reported an error while executing the call.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// The call was dropped before it could be delivered.
    #[error("call cancelled")]
    Cancelled,

    /// The owning instance ended before a result arrived.
    #[error("instance ended")]
    InstanceEnded,
}

impl CallError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CallError::Remote { .. } => "call_remote",
            CallError::Cancelled => "call_cancelled",
            CallError::InstanceEnded => "call_instance_ended",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            CallError::Remote { message } => format!("remote: {message}"),
            CallError::Cancelled => "cancelled".to_string(),
            CallError::InstanceEnded => "instance ended".to_string(),
        }
    }
}

/// # Rendering failures.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Content reported an error while writing itself.
    #[error("render failed: {error}")]
    Content { error: String },

    /// The owning scope was cancelled before rendering finished.
    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RenderError::Content { .. } => "render_content",
            RenderError::Cancelled => "render_cancelled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Failures of a door update, replace or remove.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoorError {
    /// The new content failed to render; nothing was sent.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The patch was sent but did not apply.
    #[error(transparent)]
    Call(#[from] CallError),
}

impl DoorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DoorError::Render(e) => e.as_label(),
            DoorError::Call(e) => e.as_label(),
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Hook request failures.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// No hook is registered under the requested ids.
    #[error("hook {hook} of door {door} not found")]
    NotFound { door: u64, hook: u64 },

    /// The hook was cancelled and no longer accepts triggers.
    #[error("hook cancelled")]
    Cancelled,

    /// The instance does not exist (anymore).
    #[error("instance is gone")]
    Gone,

    /// The hook handler panicked.
    #[error("hook panicked: {message}")]
    Panicked { message: String },
}

impl HookError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            HookError::NotFound { .. } => "hook_not_found",
            HookError::Cancelled => "hook_cancelled",
            HookError::Gone => "hook_instance_gone",
            HookError::Panicked { .. } => "hook_panicked",
        }
    }

    /// HTTP-like status the transport should answer with.
    pub fn status(&self) -> u16 {
        match self {
            HookError::NotFound { .. } | HookError::Cancelled | HookError::Gone => 410,
            HookError::Panicked { .. } => 500,
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors produced by the runtime itself.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A scheduled task body panicked; its instance is ended.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// The instance ended before the operation could complete.
    #[error("instance ended")]
    InstanceEnded,
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use doorframe::RuntimeError;
    ///
    /// assert_eq!(RuntimeError::InstanceEnded.as_label(), "runtime_instance_ended");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Panicked { .. } => "runtime_panicked",
            RuntimeError::InstanceEnded => "runtime_instance_ended",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::Panicked { message } => format!("panicked: {message}"),
            RuntimeError::InstanceEnded => "instance ended".to_string(),
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deck_error_integrity() {
        assert!(!DeckError::QueueLimit { limit: 1 }.is_integrity());
        assert!(DeckError::NotIssued { seq: 3 }.is_integrity());
        assert_eq!(
            DeckError::GapInverted { start: 4, end: 2 }.as_message(),
            "gap [4, 2] is inverted"
        );
    }

    #[test]
    fn test_hook_error_status() {
        assert_eq!(HookError::NotFound { door: 1, hook: 2 }.status(), 410);
        assert_eq!(
            HookError::Panicked {
                message: "boom".into()
            }
            .status(),
            500
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
