//! The server: feature host and per-frame driver.
//!
//! A [`Server`] owns the installed features and the open scenes, and runs
//! one frame per [`Server::update`] call:
//!
//! 1. `FrameBegin` on features, then on scene entities.
//! 2. Per open scene: `FixedUpdate` as many times as the fixed-step
//!    accumulator allows, then `Update`, `LateUpdate` and `Gui`.
//! 3. `Frame` on features, then on scene entities.
//! 4. `FrameEnd` on features, then on scene entities.
//!
//! A fatal callback failure aborts the rest of the frame and is returned to
//! the caller. Recoverable failures are reported to the runtime's listener.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use engine_bus::{DispatchList, Message, SubscriptionToken, topics, walk};
use engine_component::{DispatchError, FeatureLookup, Phase, Runtime, Scene, Stage};
use engine_reflect::{TypeDescriptor, Typed};
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::feature::{FEATURE_TYPE, Feature, FeatureHandle};
use crate::features::timer::TIMER_FEATURE_TYPE;

pub(crate) struct ServerInner {
    config: ServerConfig,
    runtime: Runtime,
    features: RefCell<Vec<FeatureHandle>>,
    stages: [RefCell<DispatchList<FeatureHandle>>; Stage::COUNT],
    scenes: RefCell<Vec<Scene>>,
    active: Cell<bool>,
    quit: Cell<bool>,
    /// Simulated time not yet consumed by FixedUpdate steps.
    accumulator: Cell<f64>,
    last_update: Cell<Option<Instant>>,
}

impl ServerInner {
    pub(crate) fn stage_list(&self, stage: Stage) -> &RefCell<DispatchList<FeatureHandle>> {
        &self.stages[stage.index()]
    }
}

impl FeatureLookup for ServerInner {
    fn visit_feature(
        &self,
        ty: &'static TypeDescriptor,
        visit: &mut dyn FnMut(&mut dyn Any),
    ) -> bool {
        let feature = self
            .features
            .borrow()
            .iter()
            .find(|f| f.descriptor().is_a(ty))
            .cloned();
        feature.is_some_and(|f| f.visit(visit))
    }
}

/// Shared handle to a server.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Create an inactive server on `runtime`, constructing the configured
    /// features and opening the configured scenes.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for an invalid config, or the first
    /// failure constructing a configured feature or opening a scene.
    pub fn new(runtime: &Runtime, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        runtime.register_type(&FEATURE_TYPE)?;
        runtime.register_type(&TIMER_FEATURE_TYPE)?;

        let inner = Rc::new(ServerInner {
            config,
            runtime: runtime.clone(),
            features: RefCell::new(Vec::new()),
            stages: std::array::from_fn(|_| RefCell::default()),
            scenes: RefCell::new(Vec::new()),
            active: Cell::new(false),
            quit: Cell::new(false),
            accumulator: Cell::new(0.0),
            last_update: Cell::new(None),
        });
        let lookup: Weak<dyn FeatureLookup> = Rc::downgrade(&inner) as Weak<ServerInner>;
        runtime.set_feature_lookup(lookup);

        let server = Self { inner };
        for type_name in &server.inner.config.features {
            server.add_feature_named(type_name)?;
        }
        for name in &server.inner.config.scenes {
            let scene = server.create_scene(name);
            server.open_scene(&scene)?;
        }

        info!(
            server = server.name(),
            features = server.inner.features.borrow().len(),
            scenes = server.inner.scenes.borrow().len(),
            "server created"
        );
        Ok(server)
    }

    /// Create a server on a fresh runtime.
    ///
    /// # Errors
    ///
    /// See [`Server::new`].
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let runtime = Runtime::new()?;
        Self::new(&runtime, config)
    }

    pub(crate) fn from_inner(inner: Rc<ServerInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Server) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Features ───────────────────────────────────────────────────────────

    /// Install a feature and return its handle.
    ///
    /// # Errors
    ///
    /// See [`Server::install`].
    pub fn add_feature<F: Feature>(&self, feature: F) -> Result<FeatureHandle, ServerError> {
        self.add_boxed_feature(Box::new(feature))
    }

    /// Install an already boxed feature.
    ///
    /// # Errors
    ///
    /// See [`Server::install`].
    pub fn add_boxed_feature(
        &self,
        feature: Box<dyn Feature>,
    ) -> Result<FeatureHandle, ServerError> {
        let handle = FeatureHandle::new(feature);
        self.install(&handle)?;
        Ok(handle)
    }

    /// Construct a registered feature type by name and install it.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownType`], [`ServerError::NotDerived`] or
    /// [`ServerError::NotConstructible`] if the name does not resolve to a
    /// buildable feature type, otherwise see [`Server::install`].
    pub fn add_feature_named(&self, type_name: &str) -> Result<FeatureHandle, ServerError> {
        let registry = self.runtime().registry();
        let descriptor = registry
            .find(type_name)
            .ok_or_else(|| ServerError::UnknownType(type_name.to_string()))?;
        if !descriptor.is_derived_from(&FEATURE_TYPE) {
            return Err(ServerError::NotDerived(descriptor.name()));
        }
        let feature = registry
            .create_as::<Box<dyn Feature>>(type_name, &FEATURE_TYPE)
            .ok_or(ServerError::NotConstructible(descriptor.name()))?;
        self.add_boxed_feature(feature)
    }

    /// Install a feature. On a running server it is activated immediately
    /// and told about every open scene.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotDerived`] if the type does not derive from
    ///   `Feature`.
    /// - [`ServerError::AlreadyAdded`] if the handle was installed before.
    /// - [`ServerError::DuplicateFeature`] if a feature of the same type is
    ///   installed.
    /// - [`ServerError::Activation`] if `on_activate` fails; the feature is
    ///   left uninstalled.
    pub fn install(&self, feature: &FeatureHandle) -> Result<(), ServerError> {
        let descriptor = feature.descriptor();
        if !descriptor.is_derived_from(&FEATURE_TYPE) {
            return Err(ServerError::NotDerived(descriptor.name()));
        }
        if feature.phase() != Phase::Constructed {
            return Err(ServerError::AlreadyAdded(descriptor.name()));
        }
        let duplicate = self
            .inner
            .features
            .borrow()
            .iter()
            .any(|f| std::ptr::eq(f.descriptor(), descriptor));
        if duplicate {
            return Err(ServerError::DuplicateFeature(descriptor.name()));
        }

        feature.bind(&self.inner);
        self.inner.features.borrow_mut().push(feature.clone());
        if self.is_active() {
            if let Err(err) = self.start_feature(feature) {
                self.inner.features.borrow_mut().retain(|f| !f.ptr_eq(feature));
                feature.unbind();
                return Err(err);
            }
        }

        info!(server = self.name(), feature = descriptor.name(), "feature added");
        Ok(())
    }

    /// Deactivate and drop a feature. Returns `false` if it is not installed
    /// here.
    pub fn remove_feature(&self, feature: &FeatureHandle) -> bool {
        let removed = {
            let mut features = self.inner.features.borrow_mut();
            features
                .iter()
                .position(|f| f.ptr_eq(feature))
                .map(|index| features.remove(index))
        };
        let Some(feature) = removed else {
            return false;
        };
        self.stop_feature(&feature);
        feature.detach();
        info!(server = self.name(), feature = feature.type_name(), "feature removed");
        true
    }

    /// Remove the feature of type `T`, if installed.
    pub fn remove_feature_by_type<T: Typed>(&self) -> bool {
        match self.get_feature::<T>() {
            Some(feature) => self.remove_feature(&feature),
            None => false,
        }
    }

    /// The installed feature whose type is, or derives from, `T`.
    #[must_use]
    pub fn get_feature<T: Typed>(&self) -> Option<FeatureHandle> {
        self.inner
            .features
            .borrow()
            .iter()
            .find(|f| f.is::<T>())
            .cloned()
    }

    /// Run `f` against the feature of type `T`.
    pub fn with_feature<T: Feature + Typed, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.get_feature::<T>()?.with_mut(f)
    }

    /// Snapshot of the installed features, in installation order.
    #[must_use]
    pub fn features(&self) -> Vec<FeatureHandle> {
        self.inner.features.borrow().clone()
    }

    fn start_feature(&self, feature: &FeatureHandle) -> Result<(), ServerError> {
        feature.activate()?;
        for scene in self.scenes() {
            feature.notify("on_open_scene", |f, ctx| f.on_open_scene(&scene, ctx));
        }
        Ok(())
    }

    fn stop_feature(&self, feature: &FeatureHandle) {
        if feature.is_active() {
            for scene in self.scenes().iter().rev() {
                feature.notify("on_close_scene", |f, ctx| f.on_close_scene(scene, ctx));
            }
        }
        feature.deactivate();
    }

    // ── Running state ──────────────────────────────────────────────────────

    /// Start or stop the server.
    ///
    /// Starting activates features in installation order and introduces
    /// each to the open scenes. Stopping closes scenes for each feature and
    /// deactivates the features, in reverse order.
    ///
    /// # Errors
    ///
    /// Returns the first feature activation failure. The other features
    /// still start.
    pub fn set_active(&self, active: bool) -> Result<(), ServerError> {
        if self.inner.active.get() == active {
            return Ok(());
        }
        if !active {
            self.stop();
            return Ok(());
        }

        self.inner.active.set(true);
        info!(server = self.name(), "server starting");
        self.inner.last_update.set(None);
        let mut first_error = None;
        for feature in self.features() {
            if let Err(err) = self.start_feature(&feature) {
                warn!(
                    server = self.name(),
                    feature = feature.type_name(),
                    %err,
                    "feature failed to start"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn stop(&self) {
        if !self.inner.active.replace(false) {
            return;
        }
        for feature in self.features().iter().rev() {
            self.stop_feature(feature);
        }
        info!(server = self.name(), "server stopped");
    }

    /// Ask the host application to stop after the current frame.
    pub fn request_quit(&self) {
        if !self.inner.quit.replace(true) {
            info!(server = self.name(), "quit requested");
        }
    }

    #[must_use]
    pub fn is_quit_requested(&self) -> bool {
        self.inner.quit.get()
    }

    /// Stop the server, close every scene and remove every feature, each in
    /// reverse order.
    pub fn shutdown(&self) {
        info!(server = self.name(), "server shutting down");
        self.stop();
        for scene in self.scenes().iter().rev() {
            self.close_scene(scene);
        }
        for feature in self.features().iter().rev() {
            self.remove_feature(feature);
        }
    }

    // ── Scenes ─────────────────────────────────────────────────────────────

    /// Create a closed scene on this server's runtime.
    #[must_use]
    pub fn create_scene(&self, name: &str) -> Scene {
        Scene::new(self.runtime(), name)
    }

    /// Open a scene and add it to the frame sequence. Active features are
    /// told through `on_open_scene` and the opening is announced on the
    /// bus. Opening an open scene is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the scene's activation failure. If its root could not be
    /// activated the scene is not added.
    pub fn open_scene(&self, scene: &Scene) -> Result<(), ServerError> {
        if self.inner.scenes.borrow().iter().any(|s| s == scene) {
            return Ok(());
        }
        let result = scene.open();
        if !scene.is_open() {
            return result.map_err(ServerError::from);
        }

        self.inner.scenes.borrow_mut().push(scene.clone());
        if self.is_active() {
            for feature in self.features().iter().filter(|f| f.is_active()) {
                feature.notify("on_open_scene", |f, ctx| f.on_open_scene(scene, ctx));
            }
        }
        self.send_message(topics::SCENE_OPENED, &scene.name().to_string());
        debug!(server = self.name(), scene = scene.name(), "scene added");
        result.map_err(ServerError::from)
    }

    /// Tell active features, in reverse order, that the scene is closing,
    /// then close it and announce it on the bus. Returns `false` if the scene
    /// is not open here.
    pub fn close_scene(&self, scene: &Scene) -> bool {
        let removed = {
            let mut scenes = self.inner.scenes.borrow_mut();
            scenes
                .iter()
                .position(|s| s == scene)
                .map(|index| scenes.remove(index))
        };
        let Some(scene) = removed else {
            return false;
        };
        if self.is_active() {
            for feature in self.features().iter().rev().filter(|f| f.is_active()) {
                feature.notify("on_close_scene", |f, ctx| f.on_close_scene(&scene, ctx));
            }
        }
        scene.close();
        self.send_message(topics::SCENE_CLOSED, &scene.name().to_string());
        true
    }

    /// First open scene with the given name.
    #[must_use]
    pub fn find_scene(&self, name: &str) -> Option<Scene> {
        self.inner
            .scenes
            .borrow()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Snapshot of the open scenes, in opening order.
    #[must_use]
    pub fn scenes(&self) -> Vec<Scene> {
        self.inner.scenes.borrow().clone()
    }

    // ── Messaging ──────────────────────────────────────────────────────────

    /// Publish on the runtime's bus.
    pub fn send_message<T: Any>(&self, topic: &str, payload: &T) {
        self.runtime().bus().publish(topic, payload);
    }

    /// Subscribe a host-side callback on the runtime's bus.
    pub fn add_message_listener(
        &self,
        topic: &str,
        callback: impl Fn(&Message<'_>) + 'static,
    ) -> SubscriptionToken {
        self.runtime().bus().subscribe(topic, callback)
    }

    pub fn remove_message_listener(&self, topic: &str, token: SubscriptionToken) -> bool {
        self.runtime().bus().unsubscribe(topic, token)
    }

    // ── Frame ──────────────────────────────────────────────────────────────

    /// Run one frame, timed against the previous call. The first frame after
    /// starting lasts one fixed step.
    ///
    /// # Errors
    ///
    /// See [`Server::update_with`].
    pub fn update(&self) -> Result<(), ServerError> {
        let now = Instant::now();
        let delta = self
            .inner
            .last_update
            .replace(Some(now))
            .map_or(self.inner.config.fixed_timestep, |last| {
                now.duration_since(last).as_secs_f64()
            });
        self.update_with(delta)
    }

    /// Run one frame lasting `delta` seconds. Does nothing while the server
    /// is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Dispatch`] if a callback failed fatally; the
    /// rest of the frame was skipped.
    pub fn update_with(&self, delta: f64) -> Result<(), ServerError> {
        if !self.is_active() {
            trace!(server = self.name(), "server stopped, frame skipped");
            return Ok(());
        }

        let time = self
            .runtime()
            .time()
            .advance(delta, self.inner.config.fixed_timestep);
        self.runtime().set_time(time);

        let result = self.run_frame(delta);
        if let Err(err) = &result {
            error!(server = self.name(), frame = time.frame, %err, "frame aborted");
        }
        result
    }

    fn run_frame(&self, delta: f64) -> Result<(), ServerError> {
        let scenes = self.scenes();

        self.run_feature_stage(Stage::FrameBegin)?;
        run_scene_stage(&scenes, Stage::FrameBegin)?;

        let steps = self.fixed_steps(delta);
        for scene in &scenes {
            for _ in 0..steps {
                scene.run_stage(Stage::FixedUpdate)?;
            }
            for stage in [Stage::Update, Stage::LateUpdate, Stage::Gui] {
                scene.run_stage(stage)?;
            }
        }

        self.run_feature_stage(Stage::Frame)?;
        run_scene_stage(&scenes, Stage::Frame)?;

        self.run_feature_stage(Stage::FrameEnd)?;
        run_scene_stage(&scenes, Stage::FrameEnd)?;
        Ok(())
    }

    fn run_feature_stage(&self, stage: Stage) -> Result<(), DispatchError> {
        walk(self.inner.stage_list(stage), |feature| feature.dispatch(stage))
    }

    /// Consume whole fixed steps from the accumulator.
    fn fixed_steps(&self, delta: f64) -> u32 {
        let step = self.inner.config.fixed_timestep;
        let cap = self.inner.config.max_fixed_steps;
        let accumulated = self.inner.accumulator.get() + delta.max(0.0);
        let due = (accumulated / step).floor();

        if due > f64::from(cap) {
            warn!(server = self.name(), due, cap, "fixed steps over the cap dropped");
            self.inner.accumulator.set(accumulated % step);
            return cap;
        }
        let steps = due as u32;
        self.inner
            .accumulator
            .set(accumulated - f64::from(steps) * step);
        steps
    }
}

fn run_scene_stage(scenes: &[Scene], stage: Stage) -> Result<(), DispatchError> {
    scenes.iter().try_for_each(|scene| scene.run_stage(stage))
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("active", &self.is_active())
            .field("features", &self.inner.features.borrow().len())
            .field("scenes", &self.inner.scenes.borrow().len())
            .finish_non_exhaustive()
    }
}
