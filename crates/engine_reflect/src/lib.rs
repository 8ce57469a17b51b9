//! # engine_reflect
//!
//! Reflective type identity for the engine runtime — the foundation every
//! entity, component and feature type builds on.
//!
//! This crate provides:
//!
//! - [`TypeDescriptor`] — a static, single-parent type identity with an
//!   optional constructor and optional independent marker chains.
//! - [`TypeRegistry`] — name lookup, `is-derived-from` queries and by-name
//!   construction guarded by a required base type.
//! - [`Reflect`], [`Typed`], [`Object`] — the traits that bind Rust values
//!   to descriptors, implemented through the [`reflect!`] macro.

pub mod descriptor;
pub mod error;
pub mod registry;

pub use descriptor::{
    Constructor, MAX_CHAIN_DEPTH, OBJECT_TYPE, Object, Reflect, TypeDescriptor, Typed,
};
pub use error::ReflectError;
pub use registry::TypeRegistry;
