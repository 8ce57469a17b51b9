//! Built-in features.

pub mod timer;
