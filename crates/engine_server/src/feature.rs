//! Features: server-owned behaviors driving a subsystem.
//!
//! A [`Feature`] is to the [`Server`] what a component is to an entity,
//! except that there is at most one feature of each type per server and
//! features only run in the frame stages (`FrameBegin`, `Frame`,
//! `FrameEnd`). Renderers, physics worlds and audio mixers plug in as
//! features and talk to components over the message bus.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use engine_bus::{Message, MessageBus, SubscriptionToken, topics};
use engine_component::{
    DispatchError, FrameTime, Hook, Lifecycle, Phase, Runtime, Scene, Stage, StageError,
    StageResult, StageSet,
};
use engine_reflect::{OBJECT_TYPE, Reflect, TypeDescriptor, Typed};
use tracing::{error, trace};

use crate::error::ServerError;
use crate::server::{Server, ServerInner};

/// Base descriptor of every feature type.
pub static FEATURE_TYPE: TypeDescriptor = TypeDescriptor::new("Feature", Some(&OBJECT_TYPE));

/// Constructor for feature descriptors: boxes a default `T` as
/// `Box<dyn Feature>`, the value [`Server::add_feature_named`] expects.
pub fn feature_constructor<T: Feature + Default>() -> Box<dyn Any> {
    Box::new(Box::new(T::default()) as Box<dyn Feature>)
}

/// A subsystem hosted by a server.
#[allow(unused_variables)]
pub trait Feature: Reflect {
    /// The server started, or the feature was added to a running server.
    /// Register frame stages and subscriptions here.
    fn on_activate(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    /// The feature is stopping. Its stages and subscriptions are already
    /// gone.
    fn on_deactivate(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    /// A scene was opened, or was already open when the feature activated.
    fn on_open_scene(&mut self, scene: &Scene, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    /// A scene is about to close, or the feature is stopping while it is
    /// open.
    fn on_close_scene(&mut self, scene: &Scene, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame_begin(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }

    fn on_frame_end(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        Ok(())
    }
}

struct FeatureInner {
    lifecycle: Lifecycle<dyn Feature>,
    server: RefCell<Weak<ServerInner>>,
    subscriptions: RefCell<Vec<(String, SubscriptionToken)>>,
}

/// Shared handle to a feature.
#[derive(Clone)]
pub struct FeatureHandle(Rc<FeatureInner>);

impl FeatureHandle {
    /// Wrap a feature that is not yet installed.
    #[must_use]
    pub fn new(feature: Box<dyn Feature>) -> Self {
        let descriptor = feature.reflect_type();
        Self(Rc::new(FeatureInner {
            lifecycle: Lifecycle::new(feature, descriptor),
            server: RefCell::new(Weak::new()),
            subscriptions: RefCell::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.0.lifecycle.descriptor()
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.descriptor().name()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.0.lifecycle.phase()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    #[must_use]
    pub fn stages(&self) -> StageSet {
        self.0.lifecycle.stages()
    }

    /// The server the feature is installed in.
    #[must_use]
    pub fn server(&self) -> Option<Server> {
        self.0.server.borrow().upgrade().map(Server::from_inner)
    }

    /// Returns `true` if the feature's type is, or derives from, `T`.
    #[must_use]
    pub fn is<T: Typed>(&self) -> bool {
        self.descriptor().is_a(T::static_type())
    }

    /// Borrow the concrete feature, unless it is not a `T` or is running one
    /// of its own callbacks.
    pub fn with<T: Feature, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0
            .lifecycle
            .with_behavior(|feature| feature.as_any().downcast_ref::<T>().map(f))
            .flatten()
    }

    /// Mutable variant of [`FeatureHandle::with`].
    pub fn with_mut<T: Feature, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.0
            .lifecycle
            .with_behavior_mut(|feature| feature.as_any_mut().downcast_mut::<T>().map(f))
            .flatten()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &FeatureHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ── Lifecycle transitions (driven by the server) ───────────────────────

    pub(crate) fn bind(&self, server: &Rc<ServerInner>) {
        *self.0.server.borrow_mut() = Rc::downgrade(server);
        self.0.lifecycle.set_phase(Phase::Attached);
    }

    pub(crate) fn unbind(&self) {
        *self.0.server.borrow_mut() = Weak::new();
        self.0.lifecycle.set_phase(Phase::Constructed);
    }

    pub(crate) fn activate(&self) -> Result<(), ServerError> {
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

    fn finish_activate(&self) -> Result<(), ServerError> {
        if self.phase() != Phase::Activating {
            return Ok(());
        }
        let result = self.invoke("on_activate", |feature, ctx| feature.on_activate(ctx));
        if self.phase() != Phase::Activating {
            return Ok(());
        }

        match result {
            Ok(()) => {
                self.0.lifecycle.set_phase(Phase::Active);
                for stage in self.0.lifecycle.take_pending().stages() {
                    self.insert_into_stage(stage);
                }
                trace!(feature = self.type_name(), stages = ?self.stages(), "activated");
                Ok(())
            }
            Err(source) => {
                self.0.lifecycle.set_phase(Phase::Attached);
                self.0.lifecycle.take_stages();
                self.drop_subscriptions();
                Err(ServerError::Activation {
                    type_name: self.type_name(),
                    source,
                })
            }
        }
    }

    pub(crate) fn deactivate(&self) {
        let was_active = match self.phase() {
            Phase::Active => true,
            Phase::Activating => false,
            _ => return,
        };
        self.0.lifecycle.set_phase(Phase::Attached);
        self.clear_stages();
        self.drop_subscriptions();
        if !was_active {
            return;
        }
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
            self.finish_detach();
        }
    }

    fn call_deactivate(&self) {
        let result = self.invoke("on_deactivate", |feature, ctx| feature.on_deactivate(ctx));
        self.report("on_deactivate", result);
    }

    fn finish_detach(&self) {
        self.0.lifecycle.discard();
        *self.0.server.borrow_mut() = Weak::new();
    }

    /// Run a notification hook, reporting rather than propagating failures.
    pub(crate) fn notify(
        &self,
        hook: &'static str,
        f: impl FnOnce(&mut dyn Feature, &FeatureContext<'_>) -> StageResult,
    ) {
        let result = self.invoke(hook, f);
        self.report(hook, result);
    }

    pub(crate) fn dispatch(&self, stage: Stage) -> Result<(), DispatchError> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.invoke(stage.name(), |feature, ctx| match stage {
            Stage::FrameBegin => feature.on_frame_begin(ctx),
            Stage::Frame => feature.on_frame(ctx),
            Stage::FrameEnd => feature.on_frame_end(ctx),
            _ => Ok(()),
        });
        match result {
            Ok(()) => Ok(()),
            Err(StageError::Fatal(message)) => {
                error!(
                    feature = self.type_name(),
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

    /// Hand the concrete feature to `visit`. Returns `false` if it is busy.
    pub(crate) fn visit(&self, visit: &mut dyn FnMut(&mut dyn Any)) -> bool {
        self.0
            .lifecycle
            .with_behavior_mut(|feature| visit(feature.as_any_mut()))
            .is_some()
    }

    fn invoke(
        &self,
        hook: &'static str,
        f: impl FnOnce(&mut dyn Feature, &FeatureContext<'_>) -> StageResult,
    ) -> StageResult {
        let Some(server) = self.server() else {
            return Ok(());
        };
        let Some(mut feature) = self.0.lifecycle.checkout() else {
            trace!(feature = self.type_name(), hook, "feature busy, callback skipped");
            return Ok(());
        };

        let result = {
            let ctx = FeatureContext {
                handle: self,
                server: &server,
            };
            f(feature.as_mut(), &ctx)
        };
        self.0.lifecycle.checkin(feature);
        self.run_deferred();
        result
    }

    fn run_deferred(&self) {
        while let Some(hook) = self.0.lifecycle.next_deferred() {
            match hook {
                Hook::Activate => {
                    if let Err(ServerError::Activation { source, .. }) = self.finish_activate() {
                        self.report("on_activate", Err(source));
                    }
                }
                Hook::Deactivate => self.call_deactivate(),
                Hook::Detach => self.finish_detach(),
            }
        }
    }

    fn report(&self, hook: &str, result: StageResult) {
        if let Err(err) = result {
            match self.server() {
                Some(server) => server.runtime().report_failure(self.type_name(), hook, &err),
                None => error!(feature = self.type_name(), hook, %err, "callback failed"),
            }
        }
    }

    // ── Stage and subscription bookkeeping ─────────────────────────────────

    fn insert_into_stage(&self, stage: Stage) {
        if !self.0.lifecycle.insert_stage(stage) {
            return;
        }
        if let Some(server) = self.0.server.borrow().upgrade() {
            server.stage_list(stage).borrow_mut().push(self.clone());
        }
    }

    fn register_stage(&self, stage: Stage) -> Result<(), ServerError> {
        if !stage.is_frame_stage() {
            return Err(ServerError::UnsupportedStage(stage));
        }
        match self.phase() {
            Phase::Active => {
                self.insert_into_stage(stage);
                Ok(())
            }
            Phase::Activating => {
                self.0.lifecycle.defer_stage(stage);
                Ok(())
            }
            _ => Err(ServerError::NotActive(self.type_name())),
        }
    }

    fn unregister_stage(&self, stage: Stage) -> bool {
        if !self.0.lifecycle.remove_stage(stage) {
            return false;
        }
        if let Some(server) = self.0.server.borrow().upgrade() {
            server.stage_list(stage).borrow_mut().remove(self);
        }
        true
    }

    fn clear_stages(&self) {
        let stages = self.0.lifecycle.take_stages();
        if let Some(server) = self.0.server.borrow().upgrade() {
            for stage in stages.stages() {
                server.stage_list(stage).borrow_mut().remove(self);
            }
        }
    }

    fn can_subscribe(&self) -> Result<(), ServerError> {
        match self.phase() {
            Phase::Activating | Phase::Active => Ok(()),
            _ => Err(ServerError::NotActive(self.type_name())),
        }
    }

    fn track_subscription(&self, topic: &str, token: SubscriptionToken) {
        self.0
            .subscriptions
            .borrow_mut()
            .push((topic.to_string(), token));
    }

    fn untrack_subscription(&self, topic: &str, token: SubscriptionToken) {
        self.0
            .subscriptions
            .borrow_mut()
            .retain(|(t, tok)| !(t == topic && *tok == token));
    }

    fn drop_subscriptions(&self) {
        let subscriptions = mem::take(&mut *self.0.subscriptions.borrow_mut());
        if let Some(server) = self.server() {
            for (topic, token) in subscriptions {
                server.runtime().bus().unsubscribe(&topic, token);
            }
        }
    }
}

impl PartialEq for FeatureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for FeatureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureHandle")
            .field("type", &self.type_name())
            .field("phase", &self.phase())
            .field("stages", &self.stages())
            .finish()
    }
}

/// What a feature callback can reach.
pub struct FeatureContext<'a> {
    handle: &'a FeatureHandle,
    server: &'a Server,
}

impl<'a> FeatureContext<'a> {
    #[must_use]
    pub fn handle(&self) -> &'a FeatureHandle {
        self.handle
    }

    #[must_use]
    pub fn server(&self) -> &'a Server {
        self.server
    }

    #[must_use]
    pub fn runtime(&self) -> &'a Runtime {
        self.server.runtime()
    }

    #[must_use]
    pub fn bus(&self) -> &'a MessageBus {
        self.runtime().bus()
    }

    #[must_use]
    pub fn time(&self) -> FrameTime {
        self.runtime().time()
    }

    /// Dispatch a frame stage to this feature from now on.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnsupportedStage`] for non-frame stages and
    /// [`ServerError::NotActive`] outside the activation window.
    pub fn register_stage(&self, stage: Stage) -> Result<(), ServerError> {
        self.handle.register_stage(stage)
    }

    /// Stop dispatching `stage` to this feature.
    pub fn unregister_stage(&self, stage: Stage) -> bool {
        self.handle.unregister_stage(stage)
    }

    /// Subscribe to a topic until the feature deactivates.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotActive`] outside the activation window.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&Message<'_>) + 'static,
    ) -> Result<SubscriptionToken, ServerError> {
        self.handle.can_subscribe()?;
        let token = self.bus().subscribe(topic, callback);
        self.handle.track_subscription(topic, token);
        Ok(token)
    }

    /// Typed variant of [`FeatureContext::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotActive`] outside the activation window.
    pub fn subscribe_to<T: Any>(
        &self,
        topic: &str,
        callback: impl Fn(&T) + 'static,
    ) -> Result<SubscriptionToken, ServerError> {
        self.handle.can_subscribe()?;
        let token = self.bus().subscribe_to(topic, callback);
        self.handle.track_subscription(topic, token);
        Ok(token)
    }

    pub fn unsubscribe(&self, topic: &str, token: SubscriptionToken) -> bool {
        self.handle.untrack_subscription(topic, token);
        self.bus().unsubscribe(topic, token)
    }

    /// This feature's own topic for `event`:
    /// `engine.feature.<type name>.<event>`.
    #[must_use]
    pub fn event_topic(&self, event: &str) -> String {
        topics::feature(self.handle.type_name(), event)
    }

    /// Publish `payload` on [`FeatureContext::event_topic`].
    pub fn publish_event<T: Any>(&self, event: &str, payload: &T) {
        self.bus().publish(&self.event_topic(event), payload);
    }

    /// Snapshot of the open scenes.
    #[must_use]
    pub fn scenes(&self) -> Vec<Scene> {
        self.server.scenes()
    }

    /// Ask the host application to stop after the current frame.
    pub fn request_quit(&self) {
        self.server.request_quit();
    }

    /// Run `f` against another installed feature of type `T`.
    pub fn with_feature<T: Feature + Typed, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.runtime().with_feature(T::static_type(), f)
    }

    /// Send a line to the runtime's listener, prefixed with the feature's
    /// type name.
    pub fn log(&self, message: &str) {
        self.runtime()
            .log(&format!("{}: {message}", self.handle.type_name()));
    }
}
