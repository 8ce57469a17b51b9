//! The runtime context.
//!
//! A [`Runtime`] bundles the type registry, the entity table and the message
//! bus that would otherwise be process-wide singletons. It is created once at
//! startup and handed to everything that builds entities, scenes or servers.
//! Tests create as many independent runtimes as they need.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use engine_bus::MessageBus;
use engine_reflect::{ReflectError, TypeDescriptor, TypeRegistry};
use tracing::{debug, warn};

use crate::component::COMPONENT_TYPE;
use crate::entity::ENTITY_TYPE;
use crate::error::StageError;
use crate::listener::{Listener, TracingListener};
use crate::scene::SceneId;
use crate::table::EntityTable;
use crate::time::FrameTime;

/// Resolves typed feature lookups for components.
///
/// Implemented by the server that owns the features; the runtime only keeps a
/// weak reference to it.
pub trait FeatureLookup {
    /// Find the first feature whose type is, or derives from, `ty` and hand
    /// its concrete value to `visit`. Returns `false` if none was visited.
    fn visit_feature(&self, ty: &'static TypeDescriptor, visit: &mut dyn FnMut(&mut dyn Any))
    -> bool;
}

/// Shared state behind a [`Runtime`] handle.
pub struct RuntimeInner {
    registry: TypeRegistry,
    entities: EntityTable,
    bus: MessageBus,
    listener: RefCell<Rc<dyn Listener>>,
    time: Cell<FrameTime>,
    next_scene: Cell<u32>,
    features: RefCell<Option<Weak<dyn FeatureLookup>>>,
}

/// Cheaply clonable handle to a runtime context.
#[derive(Clone)]
pub struct Runtime(Rc<RuntimeInner>);

impl Runtime {
    /// Create a runtime with the built-in entity and component types
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in descriptor cannot be registered.
    pub fn new() -> Result<Self, ReflectError> {
        let registry = TypeRegistry::new();
        registry.register(&ENTITY_TYPE)?;
        registry.register(&COMPONENT_TYPE)?;

        debug!(types = registry.len(), "runtime created");
        Ok(Self(Rc::new(RuntimeInner {
            registry,
            entities: EntityTable::new(),
            bus: MessageBus::new(),
            listener: RefCell::new(Rc::new(TracingListener)),
            time: Cell::new(FrameTime::default()),
            next_scene: Cell::new(0),
            features: RefCell::new(None),
        })))
    }

    /// The type registry.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.0.registry
    }

    /// Register a type with this runtime's registry.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register_type(&self, descriptor: &'static TypeDescriptor) -> Result<(), ReflectError> {
        self.0.registry.register(descriptor)
    }

    /// The entity table.
    #[must_use]
    pub fn entities(&self) -> &EntityTable {
        &self.0.entities
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.0.bus
    }

    /// Timing of the frame being dispatched.
    #[must_use]
    pub fn time(&self) -> FrameTime {
        self.0.time.get()
    }

    /// Publish the timing of the frame about to be dispatched. Called by the
    /// frame driver before each frame.
    pub fn set_time(&self, time: FrameTime) {
        self.0.time.set(time);
    }

    /// Replace the listener that receives reported failures.
    pub fn set_listener(&self, listener: Rc<dyn Listener>) {
        *self.0.listener.borrow_mut() = listener;
    }

    /// Send a line to the listener.
    pub fn log(&self, message: &str) {
        let listener = Rc::clone(&self.0.listener.borrow());
        listener.on_message(message);
    }

    /// Report a callback failure that was caught at a dispatch boundary.
    pub fn report_failure(&self, subject: &str, hook: &str, error: &StageError) {
        warn!(subject, hook, %error, "callback failed");
        self.log(&format!("{subject}: {hook} failed: {error}"));
    }

    /// Install the feature owner consulted by typed feature lookups.
    pub fn set_feature_lookup(&self, lookup: Weak<dyn FeatureLookup>) {
        *self.0.features.borrow_mut() = Some(lookup);
    }

    /// Run `f` against the first feature of type `T`, if one is installed and
    /// not busy running its own callback.
    pub fn with_feature<T: Any, R>(
        &self,
        ty: &'static TypeDescriptor,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let lookup = self.0.features.borrow().as_ref().and_then(Weak::upgrade)?;
        let mut f = Some(f);
        let mut out = None;
        lookup.visit_feature(ty, &mut |value| {
            if let (Some(value), Some(f)) = (value.downcast_mut::<T>(), f.take()) {
                out = Some(f(value));
            }
        });
        out
    }

    pub(crate) fn next_scene_id(&self) -> SceneId {
        let id = self.0.next_scene.get() + 1;
        self.0.next_scene.set(id);
        SceneId(id)
    }

    /// Returns `true` if both handles refer to the same runtime.
    #[must_use]
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("types", &self.0.registry.len())
            .field("entities", &self.0.entities.len())
            .field("time", &self.0.time.get())
            .finish_non_exhaustive()
    }
}
