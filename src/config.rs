//! # Runtime configuration.
//!
//! Provides [`Config`], the settings shared by every instance a
//! [`Runtime`](crate::Runtime) creates.
//!
//! ## Sentinel values
//! - `worker_limit = 0` → unbounded (no semaphore around task bodies)
//! - `queue = 0` / `pending = 0` → the defaults (1024 / 256)
//! - `request_timeout = 0s` → the default (30s)
//!
//! ## Derived timings
//! ```text
//! request_timeout ─┬─► request()   = 2/3 · request_timeout   (max connection lifetime)
//!                  └─► roll_time() = 1/2 · request_timeout   (idle connection roll)
//! instance_ttl ───────► ttl()      = max(instance_ttl, 2 · request_timeout)
//! ttl() ──────────────► touch_interval() = min(ttl / 4, 15s)
//! ```

use std::time::Duration;

const DEFAULT_QUEUE: usize = 1024;
const DEFAULT_PENDING: usize = 256;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOUCH_INTERVAL: Duration = Duration::from_secs(15);

/// Transport used to deliver outbound calls to the browser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    /// Reconnecting byte stream driven by reports (the solitaire loop).
    #[default]
    Stream,
    /// Message-oriented sender with acknowledgements (the connector).
    Events,
}

impl Transport {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Transport::Stream => "stream",
            Transport::Events => "events",
        }
    }
}

/// Configuration for instances and their outbox.
///
/// ## Field semantics
/// - `worker_limit`: Concurrent task bodies per instance (`0` = unbounded)
/// - `queue`: Deck queue limit, counted in sequence numbers (`0` = default)
/// - `pending`: Issued-but-unacknowledged call limit (`0` = default)
/// - `request_timeout`: Transport request timeout (`0s` = default)
/// - `roll_size`: Bytes written before a streaming connection is rolled
/// - `roll_pending_time`: Deadline used while calls await acknowledgement
/// - `instance_ttl`: Time an instance survives without a connection
/// - `bus_capacity`: Event bus ring buffer size (min 1)
/// - `transport`: Which outbox drives the instance
///
/// ## Notes
/// All fields are public. Prefer the accessors, they resolve sentinels and
/// enforce the relations between timings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of scheduler task bodies running at once per instance.
    pub worker_limit: usize,

    /// Maximum number of sequence numbers the deck may hold (queued and restored).
    ///
    /// Inserting past the limit fails and ends the instance with a sync error.
    pub queue: usize,

    /// Maximum number of issued calls awaiting a report.
    ///
    /// At the limit the writer pauses instead of failing.
    pub pending: usize,

    /// Request timeout of the transport in front of the runtime.
    pub request_timeout: Duration,

    /// Written bytes after which a streaming connection is rolled.
    pub roll_size: usize,

    /// Deadline applied when calls are pending, and the pause at the pending limit.
    pub roll_pending_time: Duration,

    /// Time an instance survives without any connection.
    pub instance_ttl: Duration,

    /// Capacity of the event bus broadcast ring buffer.
    pub bus_capacity: usize,

    /// Transport used by new instances.
    pub transport: Transport,
}

impl Config {
    /// Returns the worker limit as an `Option`.
    ///
    /// - `None` → unbounded
    /// - `Some(n)` → at most `n` task bodies run at once
    #[inline]
    pub fn worker_limit(&self) -> Option<usize> {
        match self.worker_limit {
            0 => None,
            n => Some(n),
        }
    }

    /// Returns the deck queue limit.
    #[inline]
    pub fn queue_limit(&self) -> usize {
        match self.queue {
            0 => DEFAULT_QUEUE,
            n => n,
        }
    }

    /// Returns the deck pending limit.
    #[inline]
    pub fn pending_limit(&self) -> usize {
        match self.pending {
            0 => DEFAULT_PENDING,
            n => n,
        }
    }

    /// Returns the effective request timeout.
    #[inline]
    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            self.request_timeout
        }
    }

    /// Maximum lifetime of one streaming connection.
    #[inline]
    pub fn request(&self) -> Duration {
        self.request_timeout() * 2 / 3
    }

    /// Idle time after which a streaming connection is rolled.
    #[inline]
    pub fn roll_time(&self) -> Duration {
        self.request_timeout() / 2
    }

    /// Instance time-to-live, never shorter than two request timeouts.
    #[inline]
    pub fn ttl(&self) -> Duration {
        self.instance_ttl.max(self.request_timeout() * 2)
    }

    /// Keepalive interval of the event-sender transport.
    #[inline]
    pub fn touch_interval(&self) -> Duration {
        (self.ttl() / 4).min(MAX_TOUCH_INTERVAL)
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `worker_limit = 16`
    /// - `queue = 1024`, `pending = 256`
    /// - `request_timeout = 30s`
    /// - `roll_size = 8 KiB`, `roll_pending_time = 100ms`
    /// - `instance_ttl = 15min`
    /// - `bus_capacity = 1024`
    /// - `transport = Transport::Stream`
    fn default() -> Self {
        Self {
            worker_limit: 16,
            queue: DEFAULT_QUEUE,
            pending: DEFAULT_PENDING,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            roll_size: 8 * 1024,
            roll_pending_time: Duration::from_millis(100),
            instance_ttl: Duration::from_secs(15 * 60),
            bus_capacity: 1024,
            transport: Transport::Stream,
        }
    }
}
