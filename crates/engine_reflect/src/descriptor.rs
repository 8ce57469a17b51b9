//! Static type descriptors and the traits that tie Rust types to them.
//!
//! A [`TypeDescriptor`] is declared once as a `static` and referenced by
//! address for the rest of the process. Identity is pointer identity: two
//! descriptors with the same name but different addresses are different types,
//! which is exactly the conflict the [`TypeRegistry`](crate::TypeRegistry)
//! refuses to register.
//!
//! ## Declaring a type
//!
//! ```rust
//! use engine_reflect::{OBJECT_TYPE, TypeDescriptor, Typed, reflect};
//!
//! pub static SHAPE_TYPE: TypeDescriptor = TypeDescriptor::new("Shape", Some(&OBJECT_TYPE));
//!
//! #[derive(Default)]
//! struct Shape;
//!
//! reflect!(Shape, SHAPE_TYPE);
//!
//! assert!(Shape::static_type().is_derived_from(&OBJECT_TYPE));
//! ```

use std::any::Any;
use std::fmt;

/// Builds a fresh, type-erased instance of a described type.
///
/// The boxed value's concrete type is a convention between the descriptor and
/// whoever calls [`TypeRegistry::create_as`](crate::TypeRegistry::create_as):
/// component descriptors box a `Box<dyn Component>`, feature descriptors a
/// `Box<dyn Feature>`.
pub type Constructor = fn() -> Box<dyn Any>;

/// Parent chains longer than this are treated as cyclic.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// Root of every object hierarchy in the engine.
pub static OBJECT_TYPE: TypeDescriptor = TypeDescriptor::new("Object", None);

/// Reflective identity of a type: its name, its single parent, an optional
/// constructor, and optional independent marker chains.
pub struct TypeDescriptor {
    name: &'static str,
    parent: Option<&'static TypeDescriptor>,
    constructor: Option<Constructor>,
    interfaces: &'static [&'static TypeDescriptor],
}

impl TypeDescriptor {
    /// Declare a type with the given name and parent.
    #[must_use]
    pub const fn new(name: &'static str, parent: Option<&'static TypeDescriptor>) -> Self {
        Self {
            name,
            parent,
            constructor: None,
            interfaces: &[],
        }
    }

    /// Attach a constructor so the type can be built by name.
    #[must_use]
    pub const fn with_constructor(self, constructor: Constructor) -> Self {
        Self {
            constructor: Some(constructor),
            ..self
        }
    }

    /// Attach marker descriptors from hierarchies unrelated to the primary
    /// parent chain.
    #[must_use]
    pub const fn with_interfaces(self, interfaces: &'static [&'static TypeDescriptor]) -> Self {
        Self { interfaces, ..self }
    }

    /// The globally unique type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The parent descriptor, or `None` for a root.
    #[must_use]
    pub const fn parent(&self) -> Option<&'static TypeDescriptor> {
        self.parent
    }

    /// Marker descriptors checked by [`TypeDescriptor::is_a`].
    #[must_use]
    pub const fn interfaces(&self) -> &'static [&'static TypeDescriptor] {
        self.interfaces
    }

    /// Returns `true` if instances can be built by name.
    #[must_use]
    pub const fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    /// Build a new instance, if the type has a constructor.
    #[must_use]
    pub fn construct(&self) -> Option<Box<dyn Any>> {
        self.constructor.map(|constructor| constructor())
    }

    /// Iterate over this descriptor and its ancestors, nearest first.
    ///
    /// The walk stops after [`MAX_CHAIN_DEPTH`] steps.
    pub fn ancestors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        std::iter::successors(Some(self), |desc| desc.parent.map(|p| p as &TypeDescriptor))
            .take(MAX_CHAIN_DEPTH)
    }

    /// Walks the parent chain from `self` to the root and returns `true` the
    /// first time a descriptor is identical to `base`.
    #[must_use]
    pub fn is_derived_from(&self, base: &TypeDescriptor) -> bool {
        self.ancestors().any(|desc| std::ptr::eq(desc, base))
    }

    /// Primary chain first, then each marker chain.
    #[must_use]
    pub fn is_a(&self, base: &TypeDescriptor) -> bool {
        self.is_derived_from(base)
            || self
                .interfaces
                .iter()
                .any(|marker| marker.is_derived_from(base))
    }

    /// Number of links from this descriptor to its root, or `None` if the
    /// chain never terminates within [`MAX_CHAIN_DEPTH`].
    #[must_use]
    pub fn depth(&self) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.parent;
        while let Some(desc) = current {
            depth += 1;
            if depth >= MAX_CHAIN_DEPTH {
                return None;
            }
            current = desc.parent;
        }
        Some(depth)
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent.map(TypeDescriptor::name))
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Dynamic access to a value's [`TypeDescriptor`].
///
/// Implement it with the [`reflect!`](crate::reflect) macro rather than by
/// hand.
pub trait Reflect: Any {
    /// The descriptor of the value's concrete type.
    fn reflect_type(&self) -> &'static TypeDescriptor;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Shorthand for `reflect_type().name()`.
    fn type_name(&self) -> &'static str {
        self.reflect_type().name()
    }

    /// Returns `true` if the value's type is, or derives from, `base` through
    /// either its parent chain or one of its marker chains.
    fn is_instance_of(&self, base: &TypeDescriptor) -> bool {
        self.reflect_type().is_a(base)
    }
}

/// Static access to a type's descriptor, for typed lookups such as
/// `get_component::<T>()`.
pub trait Typed: Reflect {
    /// The descriptor shared by every instance of `Self`.
    fn static_type() -> &'static TypeDescriptor;
}

/// A reflective unit with a local identifier.
///
/// Entities are identified by their table slot, components by their index
/// within the owning entity.
pub trait Object: Reflect {
    /// The identifier within the owning container. `0` means unassigned.
    fn instance_id(&self) -> usize;
}

/// Implement [`Reflect`] and [`Typed`] for a type bound to a static
/// descriptor.
#[macro_export]
macro_rules! reflect {
    ($ty:ty, $descriptor:path) => {
        impl $crate::Reflect for $ty {
            fn reflect_type(&self) -> &'static $crate::TypeDescriptor {
                &$descriptor
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::core::any::Any {
                self
            }
        }

        impl $crate::Typed for $ty {
            fn static_type() -> &'static $crate::TypeDescriptor {
                &$descriptor
            }
        }
    };
}
