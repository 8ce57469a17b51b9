//! Entities: named containers of components with a place in the hierarchy.
//!
//! An [`Entity`] is a shared handle. Parents own their children through
//! strong handles; children and components point back through weak ones, so
//! a destroyed owner never leaves a dangling reference behind.
//!
//! ## Activation
//!
//! An entity carries its own *active* flag and is *live* when that flag is
//! set and its parent, if any, is live. Going live activates its components
//! in attach order and then its active children; going dark deactivates
//! children and then components, both in reverse order.
//!
//! A callback that flips an active flag mid-cascade wins: the cascade checks
//! the flags again before every child, so a child deactivated by a sibling's
//! `on_activate` is skipped.
//!
//! ## Destruction
//!
//! [`Entity::destroy`] deactivates, destroys children depth-first, detaches
//! components in reverse attach order, unlinks from the parent and frees the
//! table slot. If one of the entity's components is still inside a callback,
//! the slot is freed only once that callback and its queued hooks return.
//!
//! Dropping the last handle to an entity that was never destroyed destroys
//! it, so its components still see `on_deactivate` and `on_detach`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use engine_bus::{DispatchList, topics, walk};
use engine_math::{Mat4, Transform3D};
use engine_reflect::{OBJECT_TYPE, Object, TypeDescriptor, Typed, reflect};
use tracing::{debug, warn};

use crate::component::{COMPONENT_TYPE, Component, ComponentHandle};
use crate::error::{DispatchError, EntityError};
use crate::lifecycle::Phase;
use crate::runtime::Runtime;
use crate::scene::SceneId;
use crate::stage::Stage;

/// Descriptor shared by every entity.
pub static ENTITY_TYPE: TypeDescriptor = TypeDescriptor::new("Entity", Some(&OBJECT_TYPE));

struct EntityData {
    runtime: Runtime,
    name: RefCell<String>,
    /// Table slot; 0 once released.
    slot: Cell<usize>,
    /// The entity's own active flag.
    active: Cell<bool>,
    /// Components are active: own flag set and parent live.
    live: Cell<bool>,
    layer: Cell<u8>,
    scene: Cell<SceneId>,
    parent: RefCell<WeakEntity>,
    children: RefCell<Vec<Entity>>,
    components: RefCell<Vec<ComponentHandle>>,
    next_component_id: Cell<usize>,
    dispatch: [RefCell<DispatchList<ComponentHandle>>; Stage::COUNT],
    transform: Cell<Transform3D>,
    destroyed: Cell<bool>,
    /// Callbacks of this entity's components currently on the stack.
    busy: Cell<usize>,
    release_pending: Cell<bool>,
    /// Hidden root of a scene; skipped by name lookups in the table.
    scene_root: Cell<bool>,
}

impl Drop for EntityData {
    fn drop(&mut self) {
        let slot = self.slot.replace(0);
        if slot != 0 {
            let occupant = std::ptr::from_ref::<EntityData>(self).cast::<()>();
            self.runtime.entities().release(slot, occupant);
        }
    }
}

/// Shared handle to an entity.
#[derive(Clone)]
pub struct Entity(Rc<EntityData>);

impl Drop for Entity {
    fn drop(&mut self) {
        if Rc::strong_count(&self.0) == 1 && !self.0.destroyed.get() {
            self.destroy();
        }
    }
}

/// Non-owning reference to an entity.
#[derive(Clone, Default)]
pub struct WeakEntity(Weak<EntityData>);

reflect!(Entity, ENTITY_TYPE);

impl Entity {
    /// Create an inactive root entity and place it in the runtime's table.
    #[must_use]
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Self {
        let entity = Self(Rc::new(EntityData {
            runtime: runtime.clone(),
            name: RefCell::new(name.into()),
            slot: Cell::new(0),
            active: Cell::new(false),
            live: Cell::new(false),
            layer: Cell::new(0),
            scene: Cell::new(SceneId::NONE),
            parent: RefCell::new(WeakEntity::default()),
            children: RefCell::new(Vec::new()),
            components: RefCell::new(Vec::new()),
            next_component_id: Cell::new(0),
            dispatch: std::array::from_fn(|_| RefCell::default()),
            transform: Cell::new(Transform3D::IDENTITY),
            destroyed: Cell::new(false),
            busy: Cell::new(0),
            release_pending: Cell::new(false),
            scene_root: Cell::new(false),
        }));
        let slot = runtime.entities().allocate(&entity);
        entity.0.slot.set(slot);
        debug!(entity = %entity.name(), slot, "entity created");
        entity
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Rc::downgrade(&self.0))
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.borrow_mut() = name.into();
    }

    /// The table slot, used as the entity's local identifier. `0` once the
    /// slot has been released.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.0.slot.get()
    }

    #[must_use]
    pub fn scene_id(&self) -> SceneId {
        self.0.scene.get()
    }

    /// Returns `true` for the hidden root entity a [`Scene`](crate::Scene)
    /// parents its entities to.
    #[must_use]
    pub fn is_scene_root(&self) -> bool {
        self.0.scene_root.get()
    }

    pub(crate) fn mark_scene_root(&self) {
        self.0.scene_root.set(true);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// The entity's own active flag.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    /// Returns `true` if the entity's components are active.
    #[must_use]
    pub fn is_active_in_hierarchy(&self) -> bool {
        self.0.live.get()
    }

    // ── Activation ─────────────────────────────────────────────────────────

    /// Set the entity's own active flag.
    ///
    /// Activation only reaches components when the parent chain is live as
    /// well. Deactivation never fails; callback failures during it are
    /// reported to the runtime's listener.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::Destroyed`] when activating a destroyed
    /// entity, or the first activation failure of one of its components or
    /// descendants. A component failure rolls the entity back to inactive; a
    /// descendant failure leaves only that descendant inactive.
    pub fn set_active(&self, active: bool) -> Result<(), EntityError> {
        if self.is_destroyed() {
            return if active {
                Err(EntityError::Destroyed { name: self.name() })
            } else {
                Ok(())
            };
        }
        if self.0.active.get() == active {
            return Ok(());
        }

        self.0.active.set(active);
        if active {
            if self.parent_is_live() {
                self.activate_hierarchy()?;
            }
        } else {
            self.deactivate_hierarchy();
        }
        Ok(())
    }

    fn parent_is_live(&self) -> bool {
        self.parent().is_none_or(|parent| parent.is_active_in_hierarchy())
    }

    fn activate_hierarchy(&self) -> Result<(), EntityError> {
        if self.0.live.get() || self.is_destroyed() {
            return Ok(());
        }
        self.0.live.set(true);
        self.runtime().entities().set_active(self, true);

        let components = self.components();
        for (index, component) in components.iter().enumerate() {
            if !self.0.live.get() {
                return Ok(());
            }
            if let Err(err) = component.activate() {
                warn!(entity = %self.name(), %err, "activation failed, rolling back");
                for done in components[..index].iter().rev() {
                    done.deactivate();
                }
                self.0.live.set(false);
                self.0.active.set(false);
                self.runtime().entities().set_active(self, false);
                return Err(err);
            }
        }

        let mut first_error = None;
        for child in self.children() {
            if !self.0.active.get() || !self.0.live.get() {
                break;
            }
            if child.is_active() {
                if let Err(err) = child.activate_hierarchy() {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deactivate_hierarchy(&self) {
        if !self.0.live.get() {
            return;
        }
        self.0.live.set(false);
        for child in self.children().iter().rev() {
            child.deactivate_hierarchy();
        }
        for component in self.components().iter().rev() {
            component.deactivate();
        }
        self.runtime().entities().set_active(self, false);
    }

    // ── Destruction ────────────────────────────────────────────────────────

    /// Tear the entity down. Destroying twice is a no-op.
    pub fn destroy(&self) {
        if self.0.destroyed.replace(true) {
            return;
        }
        debug!(entity = %self.name(), slot = self.slot(), "destroying entity");

        self.deactivate_hierarchy();

        let children = std::mem::take(&mut *self.0.children.borrow_mut());
        for child in children.iter().rev() {
            *child.0.parent.borrow_mut() = WeakEntity::default();
            child.destroy();
        }
        drop(children);

        loop {
            let last = self.0.components.borrow_mut().pop();
            let Some(component) = last else {
                break;
            };
            self.detach_component(&component);
        }

        if let Some(parent) = self.parent() {
            parent.remove_child(self);
        }
        *self.0.parent.borrow_mut() = WeakEntity::default();

        for list in &self.0.dispatch {
            list.borrow_mut().clear();
        }

        if self.0.busy.get() > 0 {
            self.0.release_pending.set(true);
        } else {
            self.release_slot();
        }
    }

    fn release_slot(&self) {
        let slot = self.0.slot.replace(0);
        if slot != 0 {
            self.runtime().entities().release(slot, self.as_ptr());
        }
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }

    pub(crate) fn forget_slot(&self) {
        self.0.slot.set(0);
    }

    pub(crate) fn enter(&self) {
        self.0.busy.set(self.0.busy.get() + 1);
    }

    pub(crate) fn leave(&self) {
        let busy = self.0.busy.get().saturating_sub(1);
        self.0.busy.set(busy);
        if busy == 0 && self.0.release_pending.replace(false) {
            self.release_slot();
        }
    }

    // ── Components ─────────────────────────────────────────────────────────

    /// Attach a component and return its handle.
    ///
    /// # Errors
    ///
    /// See [`Entity::attach`].
    pub fn add_component<C: Component>(
        &self,
        component: C,
    ) -> Result<ComponentHandle, EntityError> {
        self.add_boxed_component(Box::new(component))
    }

    /// Attach an already boxed component.
    ///
    /// # Errors
    ///
    /// See [`Entity::attach`].
    pub fn add_boxed_component(
        &self,
        component: Box<dyn Component>,
    ) -> Result<ComponentHandle, EntityError> {
        let handle = ComponentHandle::new(component);
        self.attach(&handle)?;
        Ok(handle)
    }

    /// Construct a registered component type by name and attach it.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::UnknownType`], [`EntityError::NotDerived`] or
    /// [`EntityError::NotConstructible`] if the name does not resolve to a
    /// buildable component type, and otherwise whatever
    /// [`Entity::attach`] returns.
    pub fn add_component_named(&self, type_name: &str) -> Result<ComponentHandle, EntityError> {
        let registry = self.runtime().registry();
        let descriptor = registry
            .find(type_name)
            .ok_or_else(|| EntityError::UnknownType(type_name.to_string()))?;
        if !descriptor.is_derived_from(&COMPONENT_TYPE) {
            return Err(EntityError::NotDerived {
                type_name: descriptor.name(),
                base: COMPONENT_TYPE.name(),
            });
        }
        let component = registry
            .create_as::<Box<dyn Component>>(type_name, &COMPONENT_TYPE)
            .ok_or(EntityError::NotConstructible(descriptor.name()))?;
        self.add_boxed_component(component)
    }

    /// Attach a constructed component.
    ///
    /// Runs `on_attach`, activates the component if the entity is live, then
    /// introduces it to the components already present.
    ///
    /// # Errors
    ///
    /// - [`EntityError::Destroyed`] if the entity has been destroyed.
    /// - [`EntityError::NotDerived`] if the type does not derive from
    ///   `Component`.
    /// - [`EntityError::AlreadyAttached`] if the handle was attached before.
    /// - [`EntityError::Attach`] or [`EntityError::Activation`] if its
    ///   `on_attach` or `on_activate` fails; the component is left unattached.
    pub fn attach(&self, component: &ComponentHandle) -> Result<(), EntityError> {
        if self.is_destroyed() {
            return Err(EntityError::Destroyed { name: self.name() });
        }
        let descriptor = component.descriptor();
        if !descriptor.is_derived_from(&COMPONENT_TYPE) {
            return Err(EntityError::NotDerived {
                type_name: descriptor.name(),
                base: COMPONENT_TYPE.name(),
            });
        }
        if component.phase() != Phase::Constructed {
            return Err(EntityError::AlreadyAttached {
                type_name: descriptor.name(),
            });
        }

        let id = self.0.next_component_id.get() + 1;
        self.0.next_component_id.set(id);
        component.bind(self, id);

        if let Err(source) = component.call_attach() {
            component.unbind();
            return Err(EntityError::Attach {
                type_name: descriptor.name(),
                source,
            });
        }
        if self.is_active_in_hierarchy() {
            if let Err(err) = component.activate() {
                component.notify("on_detach", |c, ctx| c.on_detach(ctx));
                component.unbind();
                return Err(err);
            }
        }

        let siblings = self.components();
        for sibling in &siblings {
            component.notify("on_attach_component", |c, ctx| {
                c.on_attach_component(sibling, ctx)
            });
        }
        for sibling in &siblings {
            sibling.notify("on_attach_component", |c, ctx| {
                c.on_attach_component(component, ctx)
            });
        }
        self.0.components.borrow_mut().push(component.clone());

        debug!(entity = %self.name(), component = descriptor.name(), id, "component attached");
        Ok(())
    }

    /// Detach and drop a component. Returns `false` if it is not attached to
    /// this entity.
    pub fn remove_component(&self, component: &ComponentHandle) -> bool {
        let removed = {
            let mut components = self.0.components.borrow_mut();
            components
                .iter()
                .position(|c| c.ptr_eq(component))
                .map(|index| components.remove(index))
        };
        match removed {
            Some(component) => {
                self.detach_component(&component);
                true
            }
            None => false,
        }
    }

    fn detach_component(&self, component: &ComponentHandle) {
        let siblings = self.components();
        for sibling in &siblings {
            sibling.notify("on_detach_component", |c, ctx| {
                c.on_detach_component(component, ctx)
            });
        }
        for sibling in &siblings {
            component.notify("on_detach_component", |c, ctx| {
                c.on_detach_component(sibling, ctx)
            });
        }
        component.detach();
        debug!(
            entity = %self.name(),
            component = component.descriptor().name(),
            "component detached"
        );
    }

    /// Snapshot of the attached components, in attach order.
    #[must_use]
    pub fn components(&self) -> Vec<ComponentHandle> {
        self.0.components.borrow().clone()
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.0.components.borrow().len()
    }

    /// First component whose type is, or derives from, `T`.
    #[must_use]
    pub fn get_component<T: Typed>(&self) -> Option<ComponentHandle> {
        self.get_component_of(T::static_type())
    }

    /// First component whose type is, or derives from, `ty`.
    #[must_use]
    pub fn get_component_of(&self, ty: &TypeDescriptor) -> Option<ComponentHandle> {
        self.0
            .components
            .borrow()
            .iter()
            .find(|c| c.descriptor().is_a(ty))
            .cloned()
    }

    /// Every component whose type is, or derives from, `T`.
    #[must_use]
    pub fn get_components<T: Typed>(&self) -> Vec<ComponentHandle> {
        let ty = T::static_type();
        self.0
            .components
            .borrow()
            .iter()
            .filter(|c| c.descriptor().is_a(ty))
            .cloned()
            .collect()
    }

    /// First matching component on any descendant, depth-first in child
    /// order.
    #[must_use]
    pub fn get_component_in_children<T: Typed>(&self) -> Option<ComponentHandle> {
        self.component_in_children_of(T::static_type())
    }

    fn component_in_children_of(&self, ty: &TypeDescriptor) -> Option<ComponentHandle> {
        self.children().into_iter().find_map(|child| {
            child
                .get_component_of(ty)
                .or_else(|| child.component_in_children_of(ty))
        })
    }

    /// Every matching component on every descendant, depth-first.
    #[must_use]
    pub fn get_components_in_children<T: Typed>(&self) -> Vec<ComponentHandle> {
        let mut found = Vec::new();
        self.collect_in_children(T::static_type(), &mut found);
        found
    }

    fn collect_in_children(&self, ty: &TypeDescriptor, found: &mut Vec<ComponentHandle>) {
        for child in self.children() {
            found.extend(
                child
                    .components()
                    .into_iter()
                    .filter(|c| c.descriptor().is_a(ty)),
            );
            child.collect_in_children(ty, found);
        }
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    pub(crate) fn stage_list(&self, stage: Stage) -> &RefCell<DispatchList<ComponentHandle>> {
        &self.0.dispatch[stage.index()]
    }

    /// Run `stage` for this entity's components, in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first fatal callback failure.
    pub fn dispatch(&self, stage: Stage) -> Result<(), DispatchError> {
        walk(self.stage_list(stage), |component| component.dispatch(stage))
    }

    fn dispatch_subtree(&self, stage: Stage) -> Result<(), DispatchError> {
        if !self.is_active_in_hierarchy() {
            return Ok(());
        }
        self.dispatch(stage)?;
        for child in self.children() {
            child.dispatch_subtree(stage)?;
        }
        Ok(())
    }

    /// Publish an entity-scoped event, received by components that used
    /// [`ComponentContext::subscribe_entity`](crate::ComponentContext::subscribe_entity).
    pub fn send_message<T: Any>(&self, event: &str, payload: &T) {
        let topic = topics::entity(self.slot(), event);
        self.runtime().bus().publish(&topic, payload);
    }

    // ── Layer ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn layer(&self) -> u8 {
        self.0.layer.get()
    }

    /// Change the layer tag, notifying active components before and after.
    pub fn set_layer(&self, layer: u8) {
        if self.0.layer.get() == layer {
            return;
        }
        let components = self.components();
        for component in components.iter().filter(|c| c.is_active()) {
            component.notify("on_layer_change_before", |c, ctx| c.on_layer_change_before(ctx));
        }
        self.0.layer.set(layer);
        for component in components.iter().filter(|c| c.is_active()) {
            component.notify("on_layer_change_after", |c, ctx| c.on_layer_change_after(ctx));
        }
    }

    // ── Hierarchy ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn parent(&self) -> Option<Entity> {
        self.0.parent.borrow().upgrade()
    }

    /// Snapshot of the children, in insertion order.
    #[must_use]
    pub fn children(&self) -> Vec<Entity> {
        self.0.children.borrow().clone()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.0.children.borrow().len()
    }

    /// Returns `true` if `ancestor` appears on this entity's parent chain.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Entity) -> bool {
        let mut current = self.parent();
        while let Some(entity) = current {
            if entity == *ancestor {
                return true;
            }
            current = entity.parent();
        }
        false
    }

    /// Move the entity under `parent`, or make it a root with `None`.
    ///
    /// Move hooks fire on the moved subtree before and after. The entity
    /// joins the parent's scene and follows its liveness.
    ///
    /// # Errors
    ///
    /// - [`EntityError::CyclicParent`] if `parent` is this entity or one of
    ///   its descendants; nothing is changed.
    /// - [`EntityError::Destroyed`] if either entity has been destroyed.
    /// - Activation or fatal move-hook failures.
    pub fn set_parent(&self, parent: Option<&Entity>) -> Result<(), EntityError> {
        if self.is_destroyed() {
            return Err(EntityError::Destroyed { name: self.name() });
        }
        if let Some(parent) = parent {
            if parent.is_destroyed() {
                return Err(EntityError::Destroyed {
                    name: parent.name(),
                });
            }
            if parent == self || parent.is_descendant_of(self) {
                return Err(EntityError::CyclicParent {
                    child: self.name(),
                    parent: parent.name(),
                });
            }
        }
        if self.parent().as_ref() == parent {
            return Ok(());
        }

        self.dispatch_subtree(Stage::MoveBefore)?;

        if let Some(old) = self.parent() {
            old.remove_child(self);
        }
        *self.0.parent.borrow_mut() = parent.map(Entity::downgrade).unwrap_or_default();
        if let Some(parent) = parent {
            parent.0.children.borrow_mut().push(self.clone());
        }
        self.set_scene(parent.map_or(SceneId::NONE, Entity::scene_id));

        let should_live = self.is_active() && self.parent_is_live();
        if should_live {
            self.activate_hierarchy()?;
        } else {
            self.deactivate_hierarchy();
        }

        self.dispatch_subtree(Stage::MoveAfter)?;
        Ok(())
    }

    fn remove_child(&self, child: &Entity) {
        let removed = {
            let mut children = self.0.children.borrow_mut();
            children
                .iter()
                .position(|c| c == child)
                .map(|index| children.remove(index))
        };
        drop(removed);
    }

    pub(crate) fn set_scene(&self, scene: SceneId) {
        self.0.scene.set(scene);
        for child in self.children() {
            child.set_scene(scene);
        }
    }

    /// Find a child by name. With `recurse`, direct children are checked
    /// first, then each child's subtree in order.
    #[must_use]
    pub fn find_child(&self, name: &str, recurse: bool) -> Option<Entity> {
        let children = self.children();
        if let Some(found) = children.iter().find(|c| c.name() == name) {
            return Some(found.clone());
        }
        if !recurse {
            return None;
        }
        children.iter().find_map(|c| c.find_child(name, true))
    }

    // ── Transform ──────────────────────────────────────────────────────────

    /// Transform relative to the parent.
    #[must_use]
    pub fn transform(&self) -> Transform3D {
        self.0.transform.get()
    }

    /// Replace the local transform, firing move hooks on the live subtree.
    ///
    /// # Errors
    ///
    /// Returns the first fatal move-hook failure. A failure in the
    /// `MoveBefore` pass leaves the transform unchanged.
    pub fn set_transform(&self, transform: Transform3D) -> Result<(), DispatchError> {
        self.dispatch_subtree(Stage::MoveBefore)?;
        self.0.transform.set(transform);
        self.dispatch_subtree(Stage::MoveAfter)
    }

    /// Local-to-world matrix, composed up the parent chain.
    #[must_use]
    pub fn world_transform(&self) -> Mat4 {
        let local = self.transform();
        match self.parent() {
            Some(parent) => local.in_space_of(parent.world_transform()),
            None => local.to_matrix(),
        }
    }
}

impl Object for Entity {
    fn instance_id(&self) -> usize {
        self.slot()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &*self.0.name.borrow())
            .field("slot", &self.0.slot.get())
            .field("active", &self.0.active.get())
            .field("live", &self.0.live.get())
            .field("components", &self.0.components.borrow().len())
            .finish()
    }
}

impl WeakEntity {
    #[must_use]
    pub fn upgrade(&self) -> Option<Entity> {
        self.0.upgrade().map(Entity)
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        self.0.as_ptr().cast()
    }
}

impl PartialEq for WeakEntity {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(entity) => write!(f, "WeakEntity({})", entity.name()),
            None => f.write_str("WeakEntity(dropped)"),
        }
    }
}

impl Runtime {
    /// Create an inactive root entity in this runtime's table.
    #[must_use]
    pub fn create_entity(&self, name: &str) -> Entity {
        Entity::new(self, name)
    }
}

#[cfg(test)]
mod tests {
    use engine_math::Vec3;

    use super::*;
    use crate::component::{ComponentContext, component_constructor};
    use crate::error::{StageError, StageResult};

    type Log = Rc<RefCell<Vec<String>>>;

    static RECORDER_TYPE: TypeDescriptor = TypeDescriptor::new("Recorder", Some(&COMPONENT_TYPE));
    static LIGHT_TYPE: TypeDescriptor = TypeDescriptor::new("Light", Some(&COMPONENT_TYPE))
        .with_constructor(component_constructor::<Light>);
    static CAMERA_TYPE: TypeDescriptor = TypeDescriptor::new("Camera", Some(&COMPONENT_TYPE))
        .with_constructor(component_constructor::<Camera>);

    /// Records every lifecycle hook as `<name>:<hook>`.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    reflect!(Recorder, RECORDER_TYPE);

    impl Recorder {
        fn push(&self, hook: &str) {
            self.log.borrow_mut().push(format!("{}:{hook}", self.name));
        }
    }

    impl Component for Recorder {
        fn on_attach(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            self.push("attach");
            Ok(())
        }

        fn on_detach(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            self.push("detach");
            Ok(())
        }

        fn on_activate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            self.push("activate");
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            self.push("deactivate");
            Ok(())
        }

        fn on_layer_change_after(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
            self.push(&format!("layer{}", ctx.entity().layer()));
            Ok(())
        }

        fn on_move_after(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            self.push("moved");
            Ok(())
        }
    }

    fn recorder(log: &Log, name: &'static str) -> Recorder {
        Recorder {
            name,
            log: Rc::clone(log),
        }
    }

    #[derive(Default)]
    struct Light {
        log: Option<Log>,
    }

    #[derive(Default)]
    struct Camera {
        log: Option<Log>,
    }

    reflect!(Light, LIGHT_TYPE);
    reflect!(Camera, CAMERA_TYPE);

    fn record(log: &Option<Log>, entry: &str) {
        if let Some(log) = log {
            log.borrow_mut().push(entry.to_string());
        }
    }

    impl Component for Light {
        fn on_activate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            record(&self.log, "light:activate");
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            record(&self.log, "light:deactivate");
            Ok(())
        }
    }

    impl Component for Camera {
        fn on_activate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            record(&self.log, "camera:activate");
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
            record(&self.log, "camera:deactivate");
            Ok(())
        }
    }

    #[test]
    fn test_light_camera_lifecycle() {
        let runtime = Runtime::new().unwrap();
        runtime.register_type(&LIGHT_TYPE).unwrap();
        runtime.register_type(&CAMERA_TYPE).unwrap();
        let log = Log::default();

        let entity = runtime.create_entity("rig");
        entity
            .add_component(Light {
                log: Some(Rc::clone(&log)),
            })
            .unwrap();
        entity
            .add_component(Camera {
                log: Some(Rc::clone(&log)),
            })
            .unwrap();

        entity.set_active(true).unwrap();
        assert_eq!(*log.borrow(), vec!["light:activate", "camera:activate"]);

        log.borrow_mut().clear();
        entity.set_active(false).unwrap();
        assert_eq!(*log.borrow(), vec!["camera:deactivate", "light:deactivate"]);

        let slot = entity.slot();
        entity.destroy();
        assert!(!runtime.entities().is_occupied(slot));
        let next = runtime.create_entity("next");
        assert_eq!(next.slot(), slot);
    }

    #[test]
    fn test_activation_order_three_components() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let entity = runtime.create_entity("e");
        for name in ["c1", "c2", "c3"] {
            entity.add_component(recorder(&log, name)).unwrap();
        }
        log.borrow_mut().clear();

        entity.set_active(true).unwrap();
        entity.set_active(true).unwrap();
        entity.set_active(false).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "c1:activate",
                "c2:activate",
                "c3:activate",
                "c3:deactivate",
                "c2:deactivate",
                "c1:deactivate",
            ]
        );
    }

    #[test]
    fn test_attach_to_live_entity_activates_immediately() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let entity = runtime.create_entity("e");
        entity.set_active(true).unwrap();
        let handle = entity.add_component(recorder(&log, "late")).unwrap();
        assert!(handle.is_active());
        assert!(entity.remove_component(&handle));
        assert!(!entity.remove_component(&handle));
        assert_eq!(
            *log.borrow(),
            vec!["late:attach", "late:activate", "late:deactivate", "late:detach"]
        );
    }

    #[test]
    fn test_double_attach_rejected() {
        let runtime = Runtime::new().unwrap();
        let a = runtime.create_entity("a");
        let b = runtime.create_entity("b");
        let handle = a.add_component(recorder(&Log::default(), "c")).unwrap();
        assert_eq!(
            b.attach(&handle),
            Err(EntityError::AlreadyAttached {
                type_name: "Recorder"
            })
        );
        assert_eq!(
            a.attach(&handle),
            Err(EntityError::AlreadyAttached {
                type_name: "Recorder"
            })
        );
        assert_eq!(a.component_count(), 1);
    }

    #[test]
    fn test_add_component_named() {
        let runtime = Runtime::new().unwrap();
        runtime.register_type(&LIGHT_TYPE).unwrap();
        runtime.register_type(&RECORDER_TYPE).unwrap();
        let entity = runtime.create_entity("e");

        let light = entity.add_component_named("Light").unwrap();
        assert!(light.is::<Light>());
        assert_eq!(
            entity.add_component_named("Nope").unwrap_err(),
            EntityError::UnknownType("Nope".into())
        );
        assert_eq!(
            entity.add_component_named("Entity").unwrap_err(),
            EntityError::NotDerived {
                type_name: "Entity",
                base: "Component"
            }
        );
        assert_eq!(
            entity.add_component_named("Recorder").unwrap_err(),
            EntityError::NotConstructible("Recorder")
        );
    }

    #[test]
    fn test_destroy_order() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let parent = runtime.create_entity("parent");
        let child = runtime.create_entity("child");
        child.set_parent(Some(&parent)).unwrap();
        parent.add_component(recorder(&log, "p1")).unwrap();
        parent.add_component(recorder(&log, "p2")).unwrap();
        child.add_component(recorder(&log, "c1")).unwrap();
        child.set_active(true).unwrap();
        parent.set_active(true).unwrap();
        log.borrow_mut().clear();

        let child_slot = child.slot();
        parent.destroy();
        assert_eq!(
            *log.borrow(),
            vec![
                "c1:deactivate",
                "p2:deactivate",
                "p1:deactivate",
                "c1:detach",
                "p2:detach",
                "p1:detach",
            ]
        );
        assert!(child.is_destroyed());
        assert!(!runtime.entities().is_occupied(child_slot));
        assert!(runtime.entities().is_empty());

        parent.destroy();
        assert_eq!(log.borrow().len(), 6, "second destroy is a no-op");
    }

    #[test]
    fn test_child_follows_parent_liveness() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let parent = runtime.create_entity("parent");
        let child = runtime.create_entity("child");
        child.add_component(recorder(&log, "child")).unwrap();
        child.set_parent(Some(&parent)).unwrap();
        log.borrow_mut().clear();

        child.set_active(true).unwrap();
        assert!(!child.is_active_in_hierarchy(), "parent is inactive");
        assert!(log.borrow().is_empty());

        parent.set_active(true).unwrap();
        assert!(child.is_active_in_hierarchy());
        parent.set_active(false).unwrap();
        assert!(child.is_active(), "own flag untouched");
        assert_eq!(*log.borrow(), vec!["child:activate", "child:deactivate"]);
    }

    #[test]
    fn test_cyclic_parent_rejected() {
        let runtime = Runtime::new().unwrap();
        let x = runtime.create_entity("x");
        let y = runtime.create_entity("y");
        let z = runtime.create_entity("z");
        y.set_parent(Some(&x)).unwrap();
        z.set_parent(Some(&y)).unwrap();

        let err = x.set_parent(Some(&z)).unwrap_err();
        assert_eq!(
            err,
            EntityError::CyclicParent {
                child: "x".into(),
                parent: "z".into()
            }
        );
        assert!(x.parent().is_none());
        assert_eq!(z.parent(), Some(y.clone()));
        assert!(matches!(
            x.set_parent(Some(&x)),
            Err(EntityError::CyclicParent { .. })
        ));
        assert_eq!(x.children(), vec![y]);
    }

    #[test]
    fn test_sibling_deactivated_during_cascade_is_skipped() {
        static TOGGLER_TYPE: TypeDescriptor = TypeDescriptor::new("Toggler", Some(&COMPONENT_TYPE));

        /// Deactivates a sibling entity from inside its own `on_activate`.
        struct Toggler(Entity);
        reflect!(Toggler, TOGGLER_TYPE);

        impl Component for Toggler {
            fn on_activate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                self.0.set_active(false)?;
                Ok(())
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let root = runtime.create_entity("root");
        let first = runtime.create_entity("first");
        let second = runtime.create_entity("second");
        first.set_parent(Some(&root)).unwrap();
        second.set_parent(Some(&root)).unwrap();
        second.add_component(recorder(&log, "second")).unwrap();
        first.add_component(Toggler(second.clone())).unwrap();
        first.set_active(true).unwrap();
        second.set_active(true).unwrap();
        log.borrow_mut().clear();

        root.set_active(true).unwrap();
        assert!(first.is_active_in_hierarchy());
        assert!(!second.is_active());
        assert!(!second.is_active_in_hierarchy());
        assert!(log.borrow().is_empty(), "second never activated");
    }

    #[test]
    fn test_failed_activation_rolls_back() {
        static BROKEN_TYPE: TypeDescriptor = TypeDescriptor::new("Broken", Some(&COMPONENT_TYPE));

        struct Broken;
        reflect!(Broken, BROKEN_TYPE);

        impl Component for Broken {
            fn on_activate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                Err(StageError::recoverable("missing device"))
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let entity = runtime.create_entity("e");
        entity.add_component(recorder(&log, "ok")).unwrap();
        entity.add_component(Broken).unwrap();
        log.borrow_mut().clear();

        let err = entity.set_active(true).unwrap_err();
        assert!(matches!(err, EntityError::Activation { type_name: "Broken", .. }));
        assert!(!entity.is_active());
        assert!(!entity.is_active_in_hierarchy());
        assert_eq!(runtime.entities().active_count(), 0);
        assert_eq!(*log.borrow(), vec!["ok:activate", "ok:deactivate"]);
    }

    #[test]
    fn test_self_destroy_keeps_slot_until_callback_returns() {
        static DOOMED_TYPE: TypeDescriptor = TypeDescriptor::new("Doomed", Some(&COMPONENT_TYPE));

        struct Doomed(Log);
        reflect!(Doomed, DOOMED_TYPE);

        impl Component for Doomed {
            fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                ctx.register_stage(Stage::Update)?;
                Ok(())
            }

            fn on_update(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                let slot = ctx.entity().slot();
                ctx.entity().destroy();
                let table = ctx.runtime().entities();
                let occupied = table.is_occupied(slot);
                let other = ctx.runtime().create_entity("newcomer");
                self.0.borrow_mut().push(format!(
                    "update occupied={occupied} reused={}",
                    other.slot() == slot
                ));
                other.destroy();
                Ok(())
            }

            fn on_deactivate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                self.0.borrow_mut().push("deactivate".into());
                Ok(())
            }

            fn on_detach(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                self.0.borrow_mut().push("detach".into());
                Ok(())
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let entity = runtime.create_entity("doomed");
        let slot = entity.slot();
        entity.add_component(Doomed(Rc::clone(&log))).unwrap();
        entity.set_active(true).unwrap();

        runtime.entities().run_stage(Stage::Update, SceneId::NONE).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["update occupied=true reused=false", "deactivate", "detach"]
        );
        assert!(!runtime.entities().is_occupied(slot));
        assert!(entity.is_destroyed());
    }

    #[test]
    fn test_dropping_last_handle_tears_down() {
        static PINGED_TYPE: TypeDescriptor = TypeDescriptor::new("Pinged", Some(&COMPONENT_TYPE));

        struct Pinged(Log);
        reflect!(Pinged, PINGED_TYPE);

        impl Component for Pinged {
            fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                self.0.borrow_mut().push("activate".into());
                let log = Rc::clone(&self.0);
                ctx.subscribe_to::<u32>("ping", move |_| log.borrow_mut().push("ping".into()))?;
                Ok(())
            }

            fn on_deactivate(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                self.0.borrow_mut().push("deactivate".into());
                Ok(())
            }

            fn on_detach(&mut self, _ctx: &ComponentContext<'_>) -> StageResult {
                self.0.borrow_mut().push("detach".into());
                Ok(())
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let parent = runtime.create_entity("parent");
        let child = runtime.create_entity("child");
        child.set_parent(Some(&parent)).unwrap();
        child.add_component(Pinged(Rc::clone(&log))).unwrap();
        parent.set_active(true).unwrap();
        child.set_active(true).unwrap();
        let slot = parent.slot();

        drop(child);
        runtime.bus().publish("ping", &1u32);
        assert_eq!(*log.borrow(), vec!["activate", "ping"], "parent keeps the child alive");

        drop(parent);
        runtime.bus().publish("ping", &2u32);
        assert_eq!(
            *log.borrow(),
            vec!["activate", "ping", "deactivate", "detach"]
        );
        assert_eq!(runtime.bus().subscriber_count("ping"), 0);
        assert!(!runtime.entities().is_occupied(slot));
        assert_eq!(runtime.entities().len(), 0);
    }

    #[test]
    fn test_component_lookup_in_children() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let root = runtime.create_entity("root");
        let a = runtime.create_entity("a");
        let b = runtime.create_entity("b");
        let leaf = runtime.create_entity("leaf");
        a.set_parent(Some(&root)).unwrap();
        b.set_parent(Some(&root)).unwrap();
        leaf.set_parent(Some(&a)).unwrap();
        leaf.add_component(recorder(&log, "deep")).unwrap();
        b.add_component(recorder(&log, "shallow")).unwrap();
        b.add_component(Light::default()).unwrap();

        assert!(root.get_component::<Recorder>().is_none());
        let first = root.get_component_in_children::<Recorder>().unwrap();
        assert_eq!(first.entity(), Some(leaf.clone()), "depth-first in child order");
        assert_eq!(root.get_components_in_children::<Recorder>().len(), 2);
        assert_eq!(b.get_components::<Recorder>().len(), 1);
        assert!(b.get_component::<Light>().is_some());

        assert_eq!(root.find_child("leaf", false), None);
        assert_eq!(root.find_child("leaf", true), Some(leaf));
        assert_eq!(root.find_child("b", false), Some(b));
    }

    #[test]
    fn test_layer_change_notifies_active_components() {
        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let entity = runtime.create_entity("e");
        entity.add_component(recorder(&log, "r")).unwrap();
        entity.set_layer(2);
        entity.set_active(true).unwrap();
        log.borrow_mut().clear();

        entity.set_layer(3);
        entity.set_layer(3);
        assert_eq!(*log.borrow(), vec!["r:layer3"]);
        assert_eq!(entity.layer(), 3);
    }

    #[test]
    fn test_move_hooks_and_world_transform() {
        static MOVER_TYPE: TypeDescriptor = TypeDescriptor::new("Mover", Some(&COMPONENT_TYPE));

        struct Mover(Recorder);
        reflect!(Mover, MOVER_TYPE);

        impl Component for Mover {
            fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                ctx.register_stage(Stage::MoveAfter)?;
                Ok(())
            }

            fn on_move_after(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                self.0.on_move_after(ctx)
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let parent = runtime.create_entity("parent");
        let child = runtime.create_entity("child");
        child.set_parent(Some(&parent)).unwrap();
        child.add_component(Mover(recorder(&log, "child"))).unwrap();
        child.set_active(true).unwrap();
        parent.set_active(true).unwrap();

        parent
            .set_transform(Transform3D::from_position(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        child
            .set_transform(Transform3D::from_position(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["child:moved", "child:moved"]);

        let origin = child.world_transform().transform_point3(Vec3::ZERO);
        assert!(origin.abs_diff_eq(Vec3::new(1.0, 2.0, 0.0), 1e-5));
    }

    #[test]
    fn test_entity_messages() {
        static EAR_TYPE: TypeDescriptor = TypeDescriptor::new("Ear", Some(&COMPONENT_TYPE));

        struct Ear(Log);
        reflect!(Ear, EAR_TYPE);

        impl Component for Ear {
            fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
                let log = Rc::clone(&self.0);
                ctx.subscribe_entity::<String>("hit", move |what| {
                    log.borrow_mut().push(what.clone());
                })?;
                Ok(())
            }
        }

        let runtime = Runtime::new().unwrap();
        let log = Log::default();
        let a = runtime.create_entity("a");
        let b = runtime.create_entity("b");
        a.add_component(Ear(Rc::clone(&log))).unwrap();
        a.set_active(true).unwrap();

        a.send_message("hit", &"arrow".to_string());
        b.send_message("hit", &"rock".to_string());
        assert_eq!(*log.borrow(), vec!["arrow"]);
    }

    #[test]
    fn test_entity_reflects_as_object() {
        use engine_reflect::Reflect;

        let runtime = Runtime::new().unwrap();
        let entity = runtime.create_entity("e");
        assert_eq!(entity.type_name(), "Entity");
        assert_eq!(entity.instance_id(), entity.slot());
        assert!(entity.is_instance_of(&OBJECT_TYPE));
    }
}
