//! Frame timing.

/// Timing of the frame currently being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTime {
    /// Frame counter, starting at 1 for the first frame.
    pub frame: u64,
    /// Seconds since the previous frame.
    pub delta: f64,
    /// Length of one fixed-update step, in seconds.
    pub fixed_delta: f64,
    /// Seconds accumulated over all frames.
    pub elapsed: f64,
}

impl FrameTime {
    /// Timing for the frame after this one.
    #[must_use]
    pub fn advance(self, delta: f64, fixed_delta: f64) -> Self {
        Self {
            frame: self.frame + 1,
            delta,
            fixed_delta,
            elapsed: self.elapsed + delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_accumulates() {
        let time = FrameTime::default().advance(0.5, 0.1).advance(0.25, 0.1);
        assert_eq!(time.frame, 2);
        assert!((time.elapsed - 0.75).abs() < f64::EPSILON);
        assert!((time.delta - 0.25).abs() < f64::EPSILON);
    }
}
