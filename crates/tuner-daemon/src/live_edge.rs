//! Live-edge positioning.
//!
//! While playing, engines steer toward `LiveConfig::target_offset` with
//! `live_correction`: a proportional speed inside the offset window and a
//! seek once drift passes `max_offset`.  `LiveEdgeTracker` is the safety net
//! applied when a live stream stalls: if the playhead has slipped more than
//! `TOO_FAR_BEHIND` behind the edge, jump back to the default live position
//! instead of waiting for the buffer to refill.

use std::time::Duration;

use tuner_proto::config::LiveConfig;

use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LiveCorrection {
    /// Play at this rate.
    Speed(f64),
    /// Too far out for speed alone.
    SeekToLive,
}

/// Playback rate for a given distance behind live.  1.0 at the target,
/// scaling linearly to `max_playback_speed` at `max_offset` and down to
/// `min_playback_speed` at `min_offset`.
pub fn catch_up_speed(offset: Duration, live: &LiveConfig) -> f64 {
    let offset = offset.as_secs_f64();
    let target = live.target_offset().as_secs_f64();
    let min_speed = f64::from(live.min_playback_speed).min(1.0);
    let max_speed = f64::from(live.max_playback_speed).max(1.0);
    let speed = if offset > target {
        let span = (live.max_offset().as_secs_f64() - target).max(f64::EPSILON);
        1.0 + (max_speed - 1.0) * ((offset - target) / span).min(1.0)
    } else {
        let span = (target - live.min_offset().as_secs_f64()).max(f64::EPSILON);
        1.0 - (1.0 - min_speed) * ((target - offset) / span).min(1.0)
    };
    speed.clamp(min_speed, max_speed)
}

pub fn live_correction(offset: Duration, live: &LiveConfig) -> LiveCorrection {
    if offset > live.max_offset() {
        LiveCorrection::SeekToLive
    } else {
        LiveCorrection::Speed(catch_up_speed(offset, live))
    }
}

/// Offsets strictly above this trigger a corrective seek.
pub const TOO_FAR_BEHIND: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LiveEdgeTracker {
    threshold: Duration,
}

impl Default for LiveEdgeTracker {
    fn default() -> Self {
        Self {
            threshold: TOO_FAR_BEHIND,
        }
    }
}

impl LiveEdgeTracker {
    /// Distance between the playhead and the live edge, or `None` when the
    /// engine does not classify the current item as live.
    pub async fn offset_behind_live(&self, engine: &mut dyn Engine) -> Option<Duration> {
        engine.live_offset().await
    }

    pub fn too_far_behind(&self, offset: Duration) -> bool {
        offset > self.threshold
    }

    /// Returns the offending offset when a seek to live is warranted.
    pub async fn check(&self, engine: &mut dyn Engine) -> Option<Duration> {
        let offset = self.offset_behind_live(engine).await?;
        self.too_far_behind(offset).then_some(offset)
    }
}
