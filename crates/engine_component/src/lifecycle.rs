//! Lifecycle bookkeeping shared by component and feature handles.
//!
//! A [`Lifecycle`] owns a boxed behavior and tracks where it is in the
//! attach → activate → deactivate → detach sequence, which stages it is
//! registered for, and which hooks had to wait because the behavior was busy
//! running one of its own callbacks.
//!
//! The behavior is *checked out* of the cell for the duration of a callback,
//! so nothing holds a `RefCell` borrow while user code runs. A transition
//! requested from inside that callback changes state immediately and queues
//! the matching hook; the handle runs the queue once the behavior is checked
//! back in.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;

use engine_reflect::TypeDescriptor;

use crate::stage::{Stage, StageSet};

/// Where a component or feature is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Built but not yet owned by an entity or server.
    Constructed,
    /// Owned and inactive.
    Attached,
    /// `on_activate` is running or queued.
    Activating,
    /// Between a successful `on_activate` and the next deactivation.
    Active,
    /// Detached. The behavior has been or is about to be dropped.
    Destroyed,
}

/// A lifecycle hook queued while the behavior was checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Run `on_activate` once the running callback returns.
    Activate,
    /// Run `on_deactivate` once the running callback returns.
    Deactivate,
    /// Run `on_detach` once the running callback returns.
    Detach,
}

/// State shared by every lifecycle-managed behavior.
pub struct Lifecycle<B: ?Sized> {
    behavior: RefCell<Option<Box<B>>>,
    descriptor: &'static TypeDescriptor,
    phase: Cell<Phase>,
    running: Cell<bool>,
    /// Stages the behavior is currently dispatched for.
    stages: Cell<StageSet>,
    /// Stages requested while activating, registered once activation succeeds.
    pending: Cell<StageSet>,
    deferred: RefCell<VecDeque<Hook>>,
}

impl<B: ?Sized> Lifecycle<B> {
    /// Wrap a freshly constructed behavior.
    pub fn new(behavior: Box<B>, descriptor: &'static TypeDescriptor) -> Self {
        Self {
            behavior: RefCell::new(Some(behavior)),
            descriptor,
            phase: Cell::new(Phase::Constructed),
            running: Cell::new(false),
            stages: Cell::new(StageSet::empty()),
            pending: Cell::new(StageSet::empty()),
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    /// Type of the managed behavior.
    #[must_use]
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.descriptor
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Move to `phase`. The owner is responsible for running the matching
    /// hooks.
    pub fn set_phase(&self, phase: Phase) {
        self.phase.set(phase);
    }

    /// Returns `true` while one of the behavior's callbacks is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Take the behavior out for a callback.
    ///
    /// Returns `None` if it is already running, has been dropped, or is
    /// borrowed by a `with` accessor.
    pub fn checkout(&self) -> Option<Box<B>> {
        if self.running.get() {
            return None;
        }
        let behavior = self.behavior.try_borrow_mut().ok()?.take()?;
        self.running.set(true);
        Some(behavior)
    }

    /// Return a behavior taken by [`Lifecycle::checkout`].
    pub fn checkin(&self, behavior: Box<B>) {
        if let Ok(mut slot) = self.behavior.try_borrow_mut() {
            *slot = Some(behavior);
        }
        self.running.set(false);
    }

    /// Drop the behavior for good.
    pub fn discard(&self) {
        let behavior = self
            .behavior
            .try_borrow_mut()
            .ok()
            .and_then(|mut slot| slot.take());
        drop(behavior);
    }

    /// Borrow the behavior, unless it is checked out.
    pub fn with_behavior<R>(&self, f: impl FnOnce(&B) -> R) -> Option<R> {
        let slot = self.behavior.try_borrow().ok()?;
        slot.as_deref().map(f)
    }

    /// Mutably borrow the behavior, unless it is checked out.
    pub fn with_behavior_mut<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        let mut slot = self.behavior.try_borrow_mut().ok()?;
        slot.as_deref_mut().map(f)
    }

    /// Stages the behavior is dispatched for.
    #[must_use]
    pub fn stages(&self) -> StageSet {
        self.stages.get()
    }

    /// Record a live registration. Returns `false` if it was already present.
    pub fn insert_stage(&self, stage: Stage) -> bool {
        let stages = self.stages.get();
        if stages.has(stage) {
            return false;
        }
        self.stages.set(stages | stage.flag());
        true
    }

    /// Queue a registration until activation completes.
    pub fn defer_stage(&self, stage: Stage) {
        self.pending.set(self.pending.get() | stage.flag());
    }

    /// Forget a registration, live or pending. Returns `true` if a live
    /// registration was removed.
    pub fn remove_stage(&self, stage: Stage) -> bool {
        self.pending.set(self.pending.get() - stage.flag());
        let stages = self.stages.get();
        self.stages.set(stages - stage.flag());
        stages.has(stage)
    }

    /// Take the registrations queued during activation.
    pub fn take_pending(&self) -> StageSet {
        self.pending.replace(StageSet::empty())
    }

    /// Clear every registration, returning the live ones.
    pub fn take_stages(&self) -> StageSet {
        self.pending.set(StageSet::empty());
        self.stages.replace(StageSet::empty())
    }

    /// Queue a hook to run once the current callback returns.
    pub fn defer(&self, hook: Hook) {
        self.deferred.borrow_mut().push_back(hook);
    }

    /// Pop the next queued hook.
    pub fn next_deferred(&self) -> Option<Hook> {
        self.deferred.borrow_mut().pop_front()
    }

    /// Returns `true` if hooks are queued.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }
}

impl<B: ?Sized> fmt::Debug for Lifecycle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("type", &self.descriptor.name())
            .field("phase", &self.phase.get())
            .field("running", &self.running.get())
            .field("stages", &self.stages.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use engine_reflect::OBJECT_TYPE;

    use super::*;

    fn cell() -> Lifecycle<String> {
        Lifecycle::new(Box::new("behavior".to_string()), &OBJECT_TYPE)
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let lifecycle = cell();
        let behavior = lifecycle.checkout().unwrap();
        assert!(lifecycle.is_running());
        assert!(lifecycle.checkout().is_none());
        assert!(lifecycle.with_behavior(|b| b.len()).is_none());
        lifecycle.checkin(behavior);
        assert!(!lifecycle.is_running());
        assert_eq!(lifecycle.with_behavior(|b| b.len()), Some(8));
    }

    #[test]
    fn test_checkout_after_discard() {
        let lifecycle = cell();
        lifecycle.discard();
        assert!(lifecycle.checkout().is_none());
    }

    #[test]
    fn test_stage_bookkeeping() {
        let lifecycle = cell();
        assert!(lifecycle.insert_stage(Stage::Update));
        assert!(!lifecycle.insert_stage(Stage::Update));
        lifecycle.defer_stage(Stage::Gui);
        assert_eq!(lifecycle.take_pending(), StageSet::GUI);
        assert!(lifecycle.take_pending().is_empty());

        lifecycle.defer_stage(Stage::Frame);
        assert!(!lifecycle.remove_stage(Stage::Frame), "pending only");
        assert!(lifecycle.take_pending().is_empty());

        assert_eq!(lifecycle.take_stages(), StageSet::UPDATE);
        assert!(lifecycle.stages().is_empty());
    }

    #[test]
    fn test_deferred_hooks_fifo() {
        let lifecycle = cell();
        lifecycle.defer(Hook::Deactivate);
        lifecycle.defer(Hook::Detach);
        assert!(lifecycle.has_deferred());
        assert_eq!(lifecycle.next_deferred(), Some(Hook::Deactivate));
        assert_eq!(lifecycle.next_deferred(), Some(Hook::Detach));
        assert_eq!(lifecycle.next_deferred(), None);
    }
}
