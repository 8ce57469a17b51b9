//! # engine_server
//!
//! Hosts features and drives the per-frame stage sequence.
//!
//! This crate provides:
//!
//! - [`Server`] — owns features and open scenes and runs one frame per
//!   [`Server::update`].
//! - [`Feature`] and [`FeatureHandle`] — server-owned subsystems that run in
//!   the frame stages.
//! - [`ServerConfig`] — JSON-loadable server settings.
//! - [`TimerFeature`] — built-in feature broadcasting frame timing.

pub mod config;
pub mod error;
pub mod feature;
pub mod features;
pub mod server;

pub use config::{CONFIG_ENV, ServerConfig};
pub use error::{ConfigError, ServerError};
pub use feature::{FEATURE_TYPE, Feature, FeatureContext, FeatureHandle, feature_constructor};
pub use features::timer::{TIMER_FEATURE_TYPE, TimerFeature};
pub use server::Server;
