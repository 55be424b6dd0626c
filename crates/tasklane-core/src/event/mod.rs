//! Lifecycle event distribution.

pub mod bus;

pub use bus::{EventBus, EventScope, Subscription};
