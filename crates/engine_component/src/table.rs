//! The entity table.
//!
//! Every live entity owns one slot in the table. Slots are handed out from a
//! free stack before the table grows, so churn reuses storage in O(1). A
//! released slot is nulled before its index is pushed, which makes a stale
//! slot id harmless: it resolves to nothing, never to the next occupant's
//! predecessor.
//!
//! The table also keeps the list of entities whose components are active.
//! That list is walked once per stage and may lose members mid-walk, so it is
//! a tombstoning [`DispatchList`].

use std::cell::RefCell;
use std::fmt;

use engine_bus::{DispatchList, walk};
use tracing::trace;

use crate::entity::{Entity, WeakEntity};
use crate::error::DispatchError;
use crate::scene::SceneId;
use crate::stage::Stage;

/// Registry of live entities with free-list slot reuse.
#[derive(Default)]
pub struct EntityTable {
    /// Slot `n` lives at index `n - 1`. `None` marks a free slot.
    slots: RefCell<Vec<Option<WeakEntity>>>,
    /// Indices of free slots, most recently freed on top.
    free: RefCell<Vec<usize>>,
    /// Entities whose components are active, in activation order.
    active: RefCell<DispatchList<WeakEntity>>,
}

impl EntityTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `entity` in a slot and return its 1-based slot id.
    pub fn allocate(&self, entity: &Entity) -> usize {
        let weak = entity.downgrade();
        let mut slots = self.slots.borrow_mut();
        let index = match self.free.borrow_mut().pop() {
            Some(index) => {
                slots[index] = Some(weak);
                index
            }
            None => {
                slots.push(Some(weak));
                slots.len() - 1
            }
        };
        trace!(slot = index + 1, "allocated entity slot");
        index + 1
    }

    /// Free `slot` on behalf of `occupant`, the entity data it was handed
    /// to. Releasing a free slot, an unknown slot, or a slot that has since
    /// been handed to another entity is a no-op that returns `false`.
    pub(crate) fn release(&self, slot: usize, occupant: *const ()) -> bool {
        let Some(index) = slot.checked_sub(1) else {
            return false;
        };
        let released = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(index) {
                Some(entry) if entry.as_ref().is_some_and(|w| w.as_ptr() == occupant) => {
                    entry.take()
                }
                _ => None,
            }
        };
        let Some(released) = released else {
            trace!(slot, "stale slot release ignored");
            return false;
        };

        self.free.borrow_mut().push(index);
        self.active.borrow_mut().remove(&released);
        if let Some(entity) = released.upgrade() {
            entity.forget_slot();
        }
        trace!(slot, "released entity slot");
        true
    }

    /// Add or remove an entity from the active list.
    pub fn set_active(&self, entity: &Entity, active: bool) {
        let weak = entity.downgrade();
        let mut list = self.active.borrow_mut();
        if active {
            if !list.contains(&weak) {
                list.push(weak);
            }
        } else {
            list.remove(&weak);
        }
    }

    /// First live entity with the given name. Scene roots are not
    /// matched.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Entity> {
        self.slots
            .borrow()
            .iter()
            .flatten()
            .filter_map(WeakEntity::upgrade)
            .find(|entity| !entity.is_scene_root() && entity.name() == name)
    }

    /// The entity occupying `slot`, if any.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<Entity> {
        let index = slot.checked_sub(1)?;
        self.slots
            .borrow()
            .get(index)
            .and_then(Option::as_ref)
            .and_then(WeakEntity::upgrade)
    }

    /// Returns `true` if `slot` is currently handed out.
    #[must_use]
    pub fn is_occupied(&self, slot: usize) -> bool {
        slot.checked_sub(1)
            .and_then(|index| self.slots.borrow().get(index).map(Option::is_some))
            .unwrap_or(false)
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.borrow().len() - self.free.borrow().len()
    }

    /// Returns `true` if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever created, free or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Number of entities in the active list.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.borrow().len()
    }

    /// Dispatch `stage` to every active entity in `scene`, in activation
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the first fatal callback failure; the remaining entities are
    /// not visited.
    pub fn run_stage(&self, stage: Stage, scene: SceneId) -> Result<(), DispatchError> {
        walk(&self.active, |weak| {
            let Some(entity) = weak.upgrade() else {
                return Ok(());
            };
            if entity.scene_id() != scene {
                return Ok(());
            }
            entity.dispatch(stage)
        })
    }
}

impl fmt::Debug for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityTable")
            .field("occupied", &self.len())
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}
