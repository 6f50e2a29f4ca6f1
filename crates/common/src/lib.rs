//! Common utilities for printlink
//!
//! This crate provides the pieces shared between the transport core and the
//! `printlink` binary: link state and failure types, the ordered event
//! channel that carries worker notifications back to the owning context,
//! error handling, and logging setup.

pub mod channel;
pub mod error;
pub mod link_types;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{EventReceiver, EventSender, LinkEvent, create_event_channel};
pub use error::{Error, Result};
pub use link_types::{FailureReason, LinkState};
pub use logging::setup_logging;
