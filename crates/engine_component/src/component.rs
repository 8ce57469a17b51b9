//! Components: behavior units attached to exactly one entity.
//!
//! A [`Component`] is a boxed trait object owned by a [`ComponentHandle`].
//! Every hook has a no-op default, so a component implements only the ones
//! it needs. Per-frame hooks run only for stages the component registered for
//! through its [`ComponentContext`], and only between a successful
//! `on_activate` and the next `on_deactivate`.
//!
//! ## Declaring a component
//!
//! ```rust
//! use engine_component::{
//!     COMPONENT_TYPE, Component, ComponentContext, Stage, StageResult, component_constructor,
//! };
//! use engine_reflect::{TypeDescriptor, reflect};
//!
//! pub static LIGHT_TYPE: TypeDescriptor = TypeDescriptor::new("Light", Some(&COMPONENT_TYPE))
//!     .with_constructor(component_constructor::<Light>);
//!
//! #[derive(Default)]
//! pub struct Light {
//!     intensity: f32,
//! }
//!
//! reflect!(Light, LIGHT_TYPE);
//!
//! impl Component for Light {
//!     fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
//!         ctx.register_stage(Stage::Update)?;
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use engine_bus::{Message, MessageBus, SubscriptionToken, topics};
use engine_reflect::{OBJECT_TYPE, Object, Reflect, TypeDescriptor, Typed};
use tracing::{error, trace};

use crate::entity::{Entity, WeakEntity};
use crate::error::{DispatchError, EntityError, StageError, StageResult};
use crate::lifecycle::{Hook, Lifecycle, Phase};
use crate::runtime::Runtime;
use crate::stage::{Stage, StageSet};
use crate::time::FrameTime;

/// Base descriptor of every component type.
pub static COMPONENT_TYPE: TypeDescriptor = TypeDescriptor::new("Component", Some(&OBJECT_TYPE));

/// Constructor for component descriptors: boxes a default `T` as
/// `Box<dyn Component>`, the value [`Entity::add_component_named`] expects.
pub fn component_constructor<T: Component + Default>() -> Box<dyn Any> {
    Box::new(Box::new(T::default()) as Box<dyn Component>)
}

/// A behavior attached to an entity.
#[allow(unused_variables)]
pub trait Component: Reflect {
    /// The component now belongs to an entity.
    fn on_attach(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The component is leaving its entity and will be dropped.
    fn on_detach(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The component and its entity became active. Register stages and
    /// subscriptions here.
    fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The component is going inactive. Its stages and subscriptions have
    /// already been removed.
    fn on_deactivate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// Another component joined the same entity.
    fn on_attach_component(
        &mut self,
        other: &ComponentHandle,
        ctx: &ComponentContext<'_>,
    ) -> StageResult {
        Ok(())
    }

    /// Another component left the same entity.
    fn on_detach_component(
        &mut self,
        other: &ComponentHandle,
        ctx: &ComponentContext<'_>,
    ) -> StageResult {
        Ok(())
    }

    fn on_fixed_update(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_update(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_late_update(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_gui(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The entity, or one of its ancestors, is about to move.
    fn on_move_before(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The entity, or one of its ancestors, has moved.
    fn on_move_after(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame_begin(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame_end(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The entity's layer is about to change.
    fn on_layer_change_before(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }

    /// The entity's layer has changed.
    fn on_layer_change_after(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        Ok(())
    }
}

fn run_stage_hook(
    component: &mut dyn Component,
    stage: Stage,
    ctx: &ComponentContext<'_>,
) -> StageResult {
    match stage {
        Stage::FixedUpdate => component.on_fixed_update(ctx),
        Stage::Update => component.on_update(ctx),
        Stage::LateUpdate => component.on_late_update(ctx),
        Stage::Gui => component.on_gui(ctx),
        Stage::MoveBefore => component.on_move_before(ctx),
        Stage::MoveAfter => component.on_move_after(ctx),
        Stage::FrameBegin => component.on_frame_begin(ctx),
        Stage::Frame => component.on_frame(ctx),
        Stage::FrameEnd => component.on_frame_end(ctx),
    }
}

struct ComponentInner {
    lifecycle: Lifecycle<dyn Component>,
    entity: RefCell<WeakEntity>,
    runtime: OnceCell<Runtime>,
    /// Index within the owning entity; 0 until attached.
    id: Cell<usize>,
    subscriptions: RefCell<Vec<(String, SubscriptionToken)>>,
}

/// Shared handle to an attached (or attachable) component.
#[derive(Clone)]
pub struct ComponentHandle(Rc<ComponentInner>);

impl ComponentHandle {
    /// Wrap a component that is not yet attached to anything.
    #[must_use]
    pub fn new(component: Box<dyn Component>) -> Self {
        let descriptor = component.reflect_type();
        Self(Rc::new(ComponentInner {
            lifecycle: Lifecycle::new(component, descriptor),
            entity: RefCell::new(WeakEntity::default()),
            runtime: OnceCell::new(),
            id: Cell::new(0),
            subscriptions: RefCell::new(Vec::new()),
        }))
    }

    /// The component's type descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.0.lifecycle.descriptor()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.0.lifecycle.phase()
    }

    /// Returns `true` between a successful `on_activate` and the next
    /// deactivation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    /// Stages the component is dispatched for.
    #[must_use]
    pub fn stages(&self) -> StageSet {
        self.0.lifecycle.stages()
    }

    /// The owning entity, if it is still alive.
    #[must_use]
    pub fn entity(&self) -> Option<Entity> {
        self.0.entity.borrow().upgrade()
    }

    /// Returns `true` if the component's type is, or derives from, `T`.
    #[must_use]
    pub fn is<T: Typed>(&self) -> bool {
        self.descriptor().is_a(T::static_type())
    }

    /// Borrow the concrete component.
    ///
    /// Returns `None` if it is not a `T`, or if it is busy running one of its
    /// own callbacks.
    pub fn with<T: Component, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0
            .lifecycle
            .with_behavior(|component| component.as_any().downcast_ref::<T>().map(f))
            .flatten()
    }

    /// Mutably borrow the concrete component. See [`ComponentHandle::with`].
    pub fn with_mut<T: Component, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.0
            .lifecycle
            .with_behavior_mut(|component| component.as_any_mut().downcast_mut::<T>().map(f))
            .flatten()
    }

    /// Returns `true` if both handles refer to the same component.
    #[must_use]
    pub fn ptr_eq(&self, other: &ComponentHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ── Lifecycle transitions (driven by the owning entity) ────────────────

    pub(crate) fn bind(&self, entity: &Entity, id: usize) {
        *self.0.entity.borrow_mut() = entity.downgrade();
        let _ = self.0.runtime.set(entity.runtime().clone());
        self.0.id.set(id);
        self.0.lifecycle.set_phase(Phase::Attached);
    }

    pub(crate) fn unbind(&self) {
        *self.0.entity.borrow_mut() = WeakEntity::default();
        self.0.id.set(0);
        self.0.lifecycle.set_phase(Phase::Constructed);
    }

    pub(crate) fn call_attach(&self) -> StageResult {
        self.invoke("on_attach", |component, ctx| component.on_attach(ctx))
    }

    pub(crate) fn activate(&self) -> Result<(), EntityError> {
        if self.phase() != Phase::Attached {
            return Ok(());
        }
        self.0.lifecycle.set_phase(Phase::Activating);
        if self.0.lifecycle.is_running() {
            self.0.lifecycle.defer(Hook::Activate);
            return Ok(());
        }
        self.finish_activate()
    }

    fn finish_activate(&self) -> Result<(), EntityError> {
        if self.phase() != Phase::Activating {
            return Ok(());
        }
        let result = self.invoke("on_activate", |component, ctx| component.on_activate(ctx));
        if self.phase() != Phase::Activating {
            // Deactivated or detached from inside its own on_activate.
            return Ok(());
        }

        match result {
            Ok(()) => {
                self.0.lifecycle.set_phase(Phase::Active);
                for stage in self.0.lifecycle.take_pending().stages() {
                    self.insert_into_stage(stage);
                }
                trace!(component = self.type_name(), stages = ?self.stages(), "activated");
                Ok(())
            }
            Err(source) => {
                self.0.lifecycle.set_phase(Phase::Attached);
                self.0.lifecycle.take_stages();
                self.drop_subscriptions();
                Err(EntityError::Activation {
                    type_name: self.type_name(),
                    source,
                })
            }
        }
    }

    pub(crate) fn deactivate(&self) {
        match self.phase() {
            Phase::Active => {}
            Phase::Activating => {
                self.0.lifecycle.set_phase(Phase::Attached);
                self.clear_stages();
                self.drop_subscriptions();
                return;
            }
            _ => return,
        }

        self.0.lifecycle.set_phase(Phase::Attached);
        self.clear_stages();
        self.drop_subscriptions();
        if self.0.lifecycle.is_running() {
            self.0.lifecycle.defer(Hook::Deactivate);
        } else {
            self.call_deactivate();
        }
    }

    pub(crate) fn detach(&self) {
        self.deactivate();
        self.0.lifecycle.set_phase(Phase::Destroyed);
        if self.0.lifecycle.is_running() {
            self.0.lifecycle.defer(Hook::Detach);
        } else {
            self.call_detach();
        }
    }

    fn call_deactivate(&self) {
        let result = self.invoke("on_deactivate", |component, ctx| component.on_deactivate(ctx));
        self.report("on_deactivate", result);
    }

    fn call_detach(&self) {
        let result = self.invoke("on_detach", |component, ctx| component.on_detach(ctx));
        self.report("on_detach", result);
        self.0.lifecycle.discard();
        *self.0.entity.borrow_mut() = WeakEntity::default();
    }

    /// Run a notification hook, reporting rather than propagating failures.
    pub(crate) fn notify(
        &self,
        hook: &'static str,
        f: impl FnOnce(&mut dyn Component, &ComponentContext<'_>) -> StageResult,
    ) {
        let result = self.invoke(hook, f);
        self.report(hook, result);
    }

    /// Run the component's callback for `stage`.
    ///
    /// Recoverable failures are reported to the runtime's listener.
    pub(crate) fn dispatch(&self, stage: Stage) -> Result<(), DispatchError> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.invoke(stage.name(), |component, ctx| {
            run_stage_hook(component, stage, ctx)
        });
        match result {
            Ok(()) => Ok(()),
            Err(StageError::Fatal(message)) => {
                error!(
                    component = self.type_name(),
                    %stage,
                    reason = %message,
                    "fatal stage failure"
                );
                Err(DispatchError::Fatal {
                    subject: self.type_name().to_string(),
                    stage,
                    message,
                })
            }
            Err(err) => {
                self.report(stage.name(), Err(err));
                Ok(())
            }
        }
    }

    fn invoke(
        &self,
        hook: &'static str,
        f: impl FnOnce(&mut dyn Component, &ComponentContext<'_>) -> StageResult,
    ) -> StageResult {
        let Some(entity) = self.entity() else {
            return Ok(());
        };
        let Some(mut component) = self.0.lifecycle.checkout() else {
            trace!(component = self.type_name(), hook, "component busy, callback skipped");
            return Ok(());
        };

        entity.enter();
        let result = {
            let ctx = ComponentContext {
                handle: self,
                entity: &entity,
            };
            f(component.as_mut(), &ctx)
        };
        self.0.lifecycle.checkin(component);
        self.run_deferred();
        entity.leave();
        result
    }

    fn run_deferred(&self) {
        while let Some(hook) = self.0.lifecycle.next_deferred() {
            match hook {
                Hook::Activate => {
                    if let Err(EntityError::Activation { source, .. }) = self.finish_activate() {
                        self.report("on_activate", Err(source));
                    }
                }
                Hook::Deactivate => self.call_deactivate(),
                Hook::Detach => self.call_detach(),
            }
        }
    }

    fn report(&self, hook: &str, result: StageResult) {
        if let Err(err) = result {
            match self.0.runtime.get() {
                Some(runtime) => runtime.report_failure(self.type_name(), hook, &err),
                None => error!(component = self.type_name(), hook, %err, "callback failed"),
            }
        }
    }

    // ── Stage and subscription bookkeeping ─────────────────────────────────

    fn insert_into_stage(&self, stage: Stage) {
        if !self.0.lifecycle.insert_stage(stage) {
            return;
        }
        if let Some(entity) = self.entity() {
            entity.stage_list(stage).borrow_mut().push(self.clone());
        }
    }

    fn register_stage(&self, stage: Stage) -> Result<(), EntityError> {
        match self.phase() {
            Phase::Active => {
                self.insert_into_stage(stage);
                Ok(())
            }
            Phase::Activating => {
                self.0.lifecycle.defer_stage(stage);
                Ok(())
            }
            _ => Err(EntityError::NotActive {
                type_name: self.type_name(),
            }),
        }
    }

    fn unregister_stage(&self, stage: Stage) -> bool {
        if !self.0.lifecycle.remove_stage(stage) {
            return false;
        }
        if let Some(entity) = self.entity() {
            entity.stage_list(stage).borrow_mut().remove(self);
        }
        true
    }

    fn clear_stages(&self) {
        let stages = self.0.lifecycle.take_stages();
        if let Some(entity) = self.entity() {
            for stage in stages.stages() {
                entity.stage_list(stage).borrow_mut().remove(self);
            }
        }
    }

    fn track_subscription(&self, topic: &str, token: SubscriptionToken) {
        self.0
            .subscriptions
            .borrow_mut()
            .push((topic.to_string(), token));
    }

    fn untrack_subscription(&self, topic: &str, token: SubscriptionToken) -> bool {
        let mut subscriptions = self.0.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|(t, tok)| !(t == topic && *tok == token));
        subscriptions.len() != before
    }

    fn drop_subscriptions(&self) {
        let subscriptions = mem::take(&mut *self.0.subscriptions.borrow_mut());
        if let Some(runtime) = self.0.runtime.get() {
            for (topic, token) in subscriptions {
                runtime.bus().unsubscribe(&topic, token);
            }
        }
    }

    fn can_subscribe(&self) -> Result<(), EntityError> {
        match self.phase() {
            Phase::Activating | Phase::Active => Ok(()),
            _ => Err(EntityError::NotActive {
                type_name: self.type_name(),
            }),
        }
    }
}

impl Reflect for ComponentHandle {
    fn reflect_type(&self) -> &'static TypeDescriptor {
        self.descriptor()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Object for ComponentHandle {
    fn instance_id(&self) -> usize {
        self.0.id.get()
    }
}

impl PartialEq for ComponentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("type", &self.type_name())
            .field("id", &self.0.id.get())
            .field("phase", &self.phase())
            .field("stages", &self.stages())
            .finish()
    }
}

/// What a component callback can reach: its entity, the runtime, and its
/// own stage and subscription registrations.
pub struct ComponentContext<'a> {
    handle: &'a ComponentHandle,
    entity: &'a Entity,
}

impl<'a> ComponentContext<'a> {
    /// The entity the component is attached to.
    #[must_use]
    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    /// The component's own handle.
    #[must_use]
    pub fn handle(&self) -> &'a ComponentHandle {
        self.handle
    }

    #[must_use]
    pub fn runtime(&self) -> &'a Runtime {
        self.entity.runtime()
    }

    #[must_use]
    pub fn bus(&self) -> &'a MessageBus {
        self.runtime().bus()
    }

    #[must_use]
    pub fn time(&self) -> FrameTime {
        self.runtime().time()
    }

    /// Dispatch `stage` to this component from now on.
    ///
    /// Registrations made inside `on_activate` take effect once it returns
    /// successfully.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotActive`] outside the activation window.
    pub fn register_stage(&self, stage: Stage) -> Result<(), EntityError> {
        self.handle.register_stage(stage)
    }

    /// Stop dispatching `stage` to this component. Safe from inside that
    /// stage's own callback.
    pub fn unregister_stage(&self, stage: Stage) -> bool {
        self.handle.unregister_stage(stage)
    }

    /// Subscribe to a topic for as long as the component stays active.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotActive`] outside the activation window.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&Message<'_>) + 'static,
    ) -> Result<SubscriptionToken, EntityError> {
        self.handle.can_subscribe()?;
        let token = self.bus().subscribe(topic, callback);
        self.handle.track_subscription(topic, token);
        Ok(token)
    }

    /// Typed variant of [`ComponentContext::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotActive`] outside the activation window.
    pub fn subscribe_to<T: Any>(
        &self,
        topic: &str,
        callback: impl Fn(&T) + 'static,
    ) -> Result<SubscriptionToken, EntityError> {
        self.handle.can_subscribe()?;
        let token = self.bus().subscribe_to(topic, callback);
        self.handle.track_subscription(topic, token);
        Ok(token)
    }

    /// Subscribe to an event sent with [`Entity::send_message`] on this
    /// component's own entity.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotActive`] outside the activation window.
    pub fn subscribe_entity<T: Any>(
        &self,
        event: &str,
        callback: impl Fn(&T) + 'static,
    ) -> Result<SubscriptionToken, EntityError> {
        let topic = topics::entity(self.entity.slot(), event);
        self.subscribe_to(&topic, callback)
    }

    /// Remove a subscription. Safe from inside its own callback.
    pub fn unsubscribe(&self, topic: &str, token: SubscriptionToken) -> bool {
        self.handle.untrack_subscription(topic, token);
        self.bus().unsubscribe(topic, token)
    }

    /// First component on the same entity whose type is, or derives from, `T`.
    #[must_use]
    pub fn get_component<T: Typed>(&self) -> Option<ComponentHandle> {
        self.entity.get_component::<T>()
    }

    /// Run `f` against the server's feature of type `T`.
    pub fn with_feature<T: Typed, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.runtime().with_feature(T::static_type(), f)
    }

    /// Send a line to the runtime's listener, prefixed with the component's
    /// type name.
    pub fn log(&self, message: &str) {
        self.runtime()
            .log(&format!("{}: {message}", self.handle.type_name()));
    }
}
