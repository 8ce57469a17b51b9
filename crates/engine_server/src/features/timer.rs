//! Frame timing broadcast.

use engine_bus::topics;
use engine_component::{Stage, StageResult};
use engine_reflect::{TypeDescriptor, reflect};
use tracing::trace;

use crate::feature::{FEATURE_TYPE, Feature, FeatureContext, feature_constructor};

pub static TIMER_FEATURE_TYPE: TypeDescriptor =
    TypeDescriptor::new("TimerFeature", Some(&FEATURE_TYPE))
        .with_constructor(feature_constructor::<TimerFeature>);

/// Publishes the runtime's [`FrameTime`](engine_component::FrameTime) on
/// [`topics::TIMER_FRAME`] at the start of every frame.
#[derive(Debug, Default)]
pub struct TimerFeature {
    frames: u64,
}

reflect!(TimerFeature, TIMER_FEATURE_TYPE);

impl TimerFeature {
    /// Frames seen since the feature was installed.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Feature for TimerFeature {
    fn on_activate(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        ctx.register_stage(Stage::FrameBegin)?;
        Ok(())
    }

    fn on_frame_begin(&mut self, ctx: &FeatureContext<'_>) -> StageResult {
        self.frames += 1;
        let time = ctx.time();
        trace!(frame = time.frame, delta = time.delta, "frame begin");
        ctx.bus().publish(topics::TIMER_FRAME, &time);
        Ok(())
    }
}
