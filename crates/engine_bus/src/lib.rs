//! # engine_bus
//!
//! Messaging plumbing for the engine runtime.
//!
//! This crate provides:
//!
//! - [`MessageBus`] — topic-keyed publish/subscribe with type-erased payloads.
//! - [`DispatchList`] and [`walk`] — ordered subject lists that survive
//!   removal of any subject while they are being walked.
//! - [`topics`] — well-known topic names and builders.

pub mod bus;
pub mod list;
pub mod topics;

pub use bus::{Message, MessageBus, SubscriptionToken};
pub use list::{DispatchList, walk};
