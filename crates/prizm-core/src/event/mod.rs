//! Engine event distribution.
//!
//! The runner and task runner report lifecycle changes through the
//! [`EventSink`] trait. [`EventBus`] is the default sink and fans events out
//! to any number of subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::{EventBus, EventSink, NullSink};
