//! Type registry — name lookup and by-name construction.
//!
//! The registry maps type names to their static descriptors. One registry
//! lives inside each runtime context; nothing here is process-global, so tests
//! can build as many independent registries as they like.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, error};

use crate::descriptor::{OBJECT_TYPE, TypeDescriptor};
use crate::error::ReflectError;

/// Registry of all reflective types known to a runtime.
#[derive(Debug)]
pub struct TypeRegistry {
    /// Descriptors keyed by name.
    types: RefCell<HashMap<&'static str, &'static TypeDescriptor>>,
}

impl TypeRegistry {
    /// Create a registry that knows only [`OBJECT_TYPE`].
    #[must_use]
    pub fn new() -> Self {
        let mut types = HashMap::new();
        types.insert(OBJECT_TYPE.name(), &OBJECT_TYPE);
        Self {
            types: RefCell::new(types),
        }
    }

    /// Register a descriptor together with its ancestors and marker chains.
    ///
    /// Re-registering the identical descriptor is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ReflectError::Conflict`] if a different descriptor already
    /// owns one of the names, or [`ReflectError::CyclicParent`] if a chain
    /// never reaches a root.
    pub fn register(&self, descriptor: &'static TypeDescriptor) -> Result<(), ReflectError> {
        self.register_chain(descriptor)?;
        for marker in descriptor.interfaces() {
            self.register_chain(marker)?;
        }
        Ok(())
    }

    fn register_chain(&self, descriptor: &'static TypeDescriptor) -> Result<(), ReflectError> {
        if descriptor.depth().is_none() {
            return Err(ReflectError::CyclicParent {
                name: descriptor.name(),
            });
        }

        // Roots first so a conflict never leaves a child registered without
        // its parent.
        let mut chain = Vec::new();
        let mut current = Some(descriptor);
        while let Some(desc) = current {
            chain.push(desc);
            current = desc.parent();
        }

        let mut types = self.types.borrow_mut();
        for desc in chain.into_iter().rev() {
            match types.get(desc.name()) {
                Some(existing) if std::ptr::eq(*existing, desc) => {}
                Some(_) => return Err(ReflectError::Conflict { name: desc.name() }),
                None => {
                    types.insert(desc.name(), desc);
                    debug!(
                        type_name = desc.name(),
                        parent = desc.parent().map(TypeDescriptor::name),
                        "registered type"
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a descriptor by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&'static TypeDescriptor> {
        self.types.borrow().get(name).copied()
    }

    /// Returns `true` if a descriptor with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.borrow().contains_key(name)
    }

    /// Construct an instance of `name` if it is the same as, or derived from,
    /// `required_base`.
    ///
    /// Returns `None` if the name is unknown, the base check fails, or the
    /// type has no constructor.
    #[must_use]
    pub fn create(&self, name: &str, required_base: &TypeDescriptor) -> Option<Box<dyn Any>> {
        let descriptor = self.find(name)?;
        if !descriptor.is_derived_from(required_base) {
            debug!(
                type_name = name,
                base = required_base.name(),
                "type does not derive from the required base"
            );
            return None;
        }
        descriptor.construct()
    }

    /// Like [`TypeRegistry::create`], unboxing the constructed value as `T`.
    ///
    /// A constructor that produces something other than `T` is a programming
    /// error in the type declaration; it is logged and reported as `None`.
    #[must_use]
    pub fn create_as<T: Any>(&self, name: &str, required_base: &TypeDescriptor) -> Option<T> {
        let instance = self.create(name, required_base)?;
        match instance.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(_) => {
                error!(
                    type_name = name,
                    expected = std::any::type_name::<T>(),
                    "constructor produced an unexpected value type"
                );
                None
            }
        }
    }

    /// Walks the parent chain of `a` looking for `b`.
    #[must_use]
    pub fn is_derived_from(&self, a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
        a.is_derived_from(b)
    }

    /// All registered descriptors deriving from `base`, sorted by name.
    #[must_use]
    pub fn derived_types(&self, base: &TypeDescriptor) -> Vec<&'static TypeDescriptor> {
        let mut found: Vec<_> = self
            .types
            .borrow()
            .values()
            .copied()
            .filter(|desc| desc.is_derived_from(base))
            .collect();
        found.sort_by_key(|desc| desc.name());
        found
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.borrow().len()
    }

    /// Returns `true` if nothing but the built-in root is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Reflect, reflect};

    static A: TypeDescriptor = TypeDescriptor::new("A", Some(&OBJECT_TYPE))
        .with_constructor(|| Box::new(Box::new(Node::default()) as Box<dyn Reflect>));
    static B: TypeDescriptor = TypeDescriptor::new("B", Some(&A))
        .with_constructor(|| Box::new(Box::new(Node::default()) as Box<dyn Reflect>));
    static C: TypeDescriptor = TypeDescriptor::new("C", Some(&B))
        .with_constructor(|| Box::new(Box::new(Node::default()) as Box<dyn Reflect>));
    static ABSTRACT: TypeDescriptor = TypeDescriptor::new("Abstract", Some(&A));
    static LOOP_A: TypeDescriptor = TypeDescriptor::new("LoopA", Some(&LOOP_B));
    static LOOP_B: TypeDescriptor = TypeDescriptor::new("LoopB", Some(&LOOP_A));

    #[derive(Default)]
    struct Node;

    reflect!(Node, A);

    #[test]
    fn test_register_and_find() {
        let registry = TypeRegistry::new();
        registry.register(&C).unwrap();
        assert_eq!(registry.find("C"), Some(&C));
        assert_eq!(registry.find("A"), Some(&A), "ancestors are registered");
        assert_eq!(registry.find("Missing"), None);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let registry = TypeRegistry::new();
        registry.register(&B).unwrap();
        let before = registry.len();
        registry.register(&B).unwrap();
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_conflicting_identity_rejected() {
        static OTHER_B: TypeDescriptor = TypeDescriptor::new("B", Some(&OBJECT_TYPE));
        let registry = TypeRegistry::new();
        registry.register(&B).unwrap();
        assert_eq!(
            registry.register(&OTHER_B),
            Err(ReflectError::Conflict { name: "B" })
        );
        assert_eq!(registry.find("B"), Some(&B));
    }

    #[test]
    fn test_cyclic_chain_rejected() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.register(&LOOP_A),
            Err(ReflectError::CyclicParent { name: "LoopA" })
        );
        assert!(!registry.contains("LoopB"));
    }

    #[test]
    fn test_type_chain_queries() {
        let registry = TypeRegistry::new();
        registry.register(&C).unwrap();
        assert!(registry.is_derived_from(&C, &A));
        assert!(!registry.is_derived_from(&A, &C));
    }

    #[test]
    fn test_create_checks_required_base() {
        let registry = TypeRegistry::new();
        registry.register(&C).unwrap();
        assert!(registry.create("C", &A).is_some());
        assert!(registry.create("A", &C).is_none());
        assert!(registry.create("Unknown", &A).is_none());
    }

    #[test]
    fn test_create_without_constructor() {
        let registry = TypeRegistry::new();
        registry.register(&ABSTRACT).unwrap();
        assert!(registry.create("Abstract", &A).is_none());
    }

    #[test]
    fn test_create_as_unboxes() {
        let registry = TypeRegistry::new();
        registry.register(&B).unwrap();
        let node = registry.create_as::<Box<dyn Reflect>>("B", &OBJECT_TYPE);
        assert_eq!(node.map(|n| n.type_name()), Some("A"));
        assert!(registry.create_as::<String>("B", &OBJECT_TYPE).is_none());
    }

    #[test]
    fn test_derived_types_sorted() {
        let registry = TypeRegistry::new();
        registry.register(&C).unwrap();
        registry.register(&ABSTRACT).unwrap();
        let names: Vec<_> = registry
            .derived_types(&A)
            .into_iter()
            .map(TypeDescriptor::name)
            .collect();
        assert_eq!(names, vec!["A", "Abstract", "B", "C"]);
    }
}
