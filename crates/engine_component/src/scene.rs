//! Scenes: disjoint trees of entities that open and close together.
//!
//! Every scene owns a hidden root entity. Entities spawned into the scene, or
//! parented anywhere under its root, carry the scene's [`SceneId`] and are
//! dispatched only when the scene's own stages run.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info};

use crate::entity::Entity;
use crate::error::{DispatchError, EntityError};
use crate::runtime::Runtime;
use crate::stage::Stage;

/// Identifier of a scene within its runtime. `SceneId::NONE` tags entities
/// that belong to no scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SceneId(pub u32);

impl SceneId {
    pub const NONE: SceneId = SceneId(0);
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene#{}", self.0)
    }
}

struct SceneInner {
    id: SceneId,
    name: String,
    root: Entity,
    runtime: Runtime,
    open: Cell<bool>,
}

/// Shared handle to a scene.
#[derive(Clone)]
pub struct Scene(Rc<SceneInner>);

impl Scene {
    /// Create a closed, empty scene.
    #[must_use]
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Self {
        let name = name.into();
        let id = runtime.next_scene_id();
        let root = runtime.create_entity(&name);
        root.mark_scene_root();
        root.set_scene(id);
        debug!(scene = %name, %id, "scene created");
        Self(Rc::new(SceneInner {
            id,
            name,
            root,
            runtime: runtime.clone(),
            open: Cell::new(false),
        }))
    }

    #[must_use]
    pub fn id(&self) -> SceneId {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The entity every top-level scene entity is parented to.
    #[must_use]
    pub fn root(&self) -> &Entity {
        &self.0.root
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.open.get()
    }

    /// Create an active entity under the scene root. It goes live when the
    /// scene is open.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::Destroyed`] once the scene has been closed.
    pub fn spawn(&self, name: &str) -> Result<Entity, EntityError> {
        let entity = self.0.runtime.create_entity(name);
        if let Err(err) = entity.set_parent(Some(&self.0.root)) {
            entity.destroy();
            return Err(err);
        }
        entity.set_active(true)?;
        Ok(entity)
    }

    /// First entity in the scene with the given name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Entity> {
        self.0.root.find_child(name, true)
    }

    /// Activate the scene's entities. Opening an open scene is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first activation failure. The scene stays closed if the
    /// root itself could not be activated, and a closed scene cannot be
    /// reopened.
    pub fn open(&self) -> Result<(), EntityError> {
        if self.is_open() {
            return Ok(());
        }
        let result = self.0.root.set_active(true);
        self.0.open.set(self.0.root.is_active_in_hierarchy());
        if self.is_open() {
            info!(scene = %self.0.name, id = %self.0.id, "scene opened");
        }
        result
    }

    /// Deactivate, then destroy, every entity in the scene.
    pub fn close(&self) {
        if self.0.root.is_destroyed() {
            return;
        }
        self.0.open.set(false);
        self.0.root.set_active(false).ok();
        self.0.root.destroy();
        info!(scene = %self.0.name, id = %self.0.id, "scene closed");
    }

    /// Dispatch `stage` to the scene's live entities, in activation order.
    ///
    /// # Errors
    ///
    /// Returns the first fatal callback failure.
    pub fn run_stage(&self, stage: Stage) -> Result<(), DispatchError> {
        if !self.is_open() {
            return Ok(());
        }
        self.0.runtime.entities().run_stage(stage, self.0.id)
    }

    /// Returns `true` if both handles refer to the same scene.
    #[must_use]
    pub fn ptr_eq(&self, other: &Scene) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Scene {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("open", &self.0.open.get())
            .field("entities", &self.0.root.child_count())
            .finish()
    }
}
