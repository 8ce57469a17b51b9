//! # engine_component
//!
//! The entity/component runtime: who owns what, when behaviors run, and in
//! which order.
//!
//! This crate provides:
//!
//! - [`Runtime`] — the context bundling the type registry, entity table and
//!   message bus, created once and passed explicitly.
//! - [`EntityTable`] — slot allocation with free-list reuse and the list of
//!   active entities walked every stage.
//! - [`Entity`] — named hierarchy node owning its children and components.
//! - [`Component`] and [`ComponentHandle`] — attachable behaviors with an
//!   activate/deactivate window and per-stage registration.
//! - [`Stage`] and [`StageSet`] — the dispatch stages of a frame.
//! - [`Scene`] — a tree of entities opened and closed as one.
//! - [`Listener`] — sink for reported callback failures.
//! - [`Lifecycle`] — checkout-based bookkeeping shared with the server's
//!   features.
//!
//! Everything here is single-threaded: handles are `Rc`-based and callbacks
//! run to completion on the frame thread.

pub mod component;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod runtime;
pub mod scene;
pub mod stage;
pub mod table;
pub mod time;

pub use component::{
    COMPONENT_TYPE, Component, ComponentContext, ComponentHandle, component_constructor,
};
pub use entity::{ENTITY_TYPE, Entity, WeakEntity};
pub use error::{DispatchError, EntityError, StageError, StageResult};
pub use lifecycle::{Hook, Lifecycle, Phase};
pub use listener::{Listener, TracingListener};
pub use runtime::{FeatureLookup, Runtime};
pub use scene::{Scene, SceneId};
pub use stage::{Stage, StageSet};
pub use table::EntityTable;
pub use time::FrameTime;
