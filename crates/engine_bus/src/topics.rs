//! Well-known message topics.
//!
//! All engine topics are prefixed with `engine.`. Each topic carries exactly
//! one payload type, noted on its constant.

/// Root prefix for all engine topics.
pub const PREFIX: &str = "engine";

// ── Timing ──────────────────────────────────────────────────────────────────

/// Frame timing, published at frame begin. Payload: `FrameTime`.
pub const TIMER_FRAME: &str = "engine.timer.frame";

// ── Scene lifecycle ─────────────────────────────────────────────────────────

/// A scene was opened on the server. Payload: `String` (scene name).
pub const SCENE_OPENED: &str = "engine.scene.opened";

/// A scene was closed on the server. Payload: `String` (scene name).
pub const SCENE_CLOSED: &str = "engine.scene.closed";

// ── Dynamic topic builders ──────────────────────────────────────────────────

/// Build a topic owned by a feature.
///
/// `engine.feature.<feature_name>.<event>`
#[must_use]
pub fn feature(feature_name: &str, event: &str) -> String {
    format!("{PREFIX}.feature.{feature_name}.{event}")
}

/// Build a topic scoped to one entity.
///
/// `engine.entity.<instance_id>.<event>`
#[must_use]
pub fn entity(instance_id: usize, event: &str) -> String {
    format!("{PREFIX}.entity.{instance_id}.{event}")
}
