//! # Event subscribers.
//!
//! The [`Subscribe`] trait and the [`SubscriberSet`] fan-out that delivers
//! [`Bus`](crate::events::Bus) events to user subscribers.
//!
//! ```text
//! Instance ── publish(Event) ──► Bus ──► Runtime listener ──► SubscriberSet
//!                                                               ├──► LogWriter
//!                                                               └──► custom
//! ```

#[cfg(feature = "logging")]
mod log;
mod set;
mod subscriber;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
