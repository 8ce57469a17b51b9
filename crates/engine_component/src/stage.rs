//! Dispatch stages.
//!
//! A [`Stage`] is one phase of the per-frame sequence. Components and
//! features opt into the stages they care about; each stage then visits only
//! its registered subjects, in registration order.

use std::fmt;

use bitflags::bitflags;

/// One named phase of per-frame dispatch.
///
/// The declaration order is the order of [`Stage::ALL`]; it is not the order
/// the server runs them in (see the server's frame sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    FixedUpdate,
    Update,
    LateUpdate,
    Gui,
    MoveBefore,
    MoveAfter,
    FrameBegin,
    Frame,
    FrameEnd,
}

impl Stage {
    /// Number of stages.
    pub const COUNT: usize = 9;

    /// Every stage, in declaration order.
    pub const ALL: [Stage; Self::COUNT] = [
        Stage::FixedUpdate,
        Stage::Update,
        Stage::LateUpdate,
        Stage::Gui,
        Stage::MoveBefore,
        Stage::MoveAfter,
        Stage::FrameBegin,
        Stage::Frame,
        Stage::FrameEnd,
    ];

    /// Index into per-stage arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Stage::FixedUpdate => "FixedUpdate",
            Stage::Update => "Update",
            Stage::LateUpdate => "LateUpdate",
            Stage::Gui => "Gui",
            Stage::MoveBefore => "MoveBefore",
            Stage::MoveAfter => "MoveAfter",
            Stage::FrameBegin => "FrameBegin",
            Stage::Frame => "Frame",
            Stage::FrameEnd => "FrameEnd",
        }
    }

    /// Returns `true` for the stages features may register for.
    #[must_use]
    pub const fn is_frame_stage(self) -> bool {
        matches!(self, Stage::FrameBegin | Stage::Frame | Stage::FrameEnd)
    }

    /// The single-bit set for this stage.
    #[must_use]
    pub const fn flag(self) -> StageSet {
        StageSet::from_bits_truncate(1 << self as u16)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// A set of stages, one bit per [`Stage`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageSet: u16 {
        const FIXED_UPDATE = 1 << 0;
        const UPDATE = 1 << 1;
        const LATE_UPDATE = 1 << 2;
        const GUI = 1 << 3;
        const MOVE_BEFORE = 1 << 4;
        const MOVE_AFTER = 1 << 5;
        const FRAME_BEGIN = 1 << 6;
        const FRAME = 1 << 7;
        const FRAME_END = 1 << 8;
    }
}

impl StageSet {
    /// Returns `true` if `stage` is in the set.
    #[must_use]
    pub fn has(self, stage: Stage) -> bool {
        self.contains(stage.flag())
    }

    /// The stages in the set, in declaration order.
    pub fn stages(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |stage| self.has(*stage))
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        iter.into_iter()
            .fold(StageSet::empty(), |set, stage| set | stage.flag())
    }
}
