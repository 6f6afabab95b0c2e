//! The "CLOCK" Engine - Render Clock Synchronizer
//!
//! Maps the external time authority's two operating modes onto the local
//! render clock the frame loop consumes:
//! - REALTIME: free-running, render time trails the newest accepted live
//!   sample by a fixed lag buffer so a future bracketing sample always
//!   exists (constant display latency instead of extrapolation jitter)
//! - FIXED: explicit scrub window; render time is the clamped scrub position
//!
//! Authority events arrive as a typed enum; after teardown every event is
//! ignored, so no callback effect survives the session.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Runtime configuration for the clock synchronizer.
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Seconds the realtime render clock trails the newest live sample.
    ///
    /// Large enough to cover typical delivery jitter; configurable because
    /// different feeds have very different latency envelopes.
    pub lag_buffer: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { lag_buffer: 3.0 }
    }
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

/// Operating mode of the external time authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Free-running, wall time drives the frame loop
    Realtime,
    /// Explicit scrubbable window
    Fixed,
}

/// Window published by the time authority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockBounds {
    pub start: f64,
    pub end: f64,
}

impl ClockBounds {
    /// Finite, non-inverted window.
    pub fn is_valid(&self) -> bool {
        self.start.is_finite() && self.end.is_finite() && self.start <= self.end
    }

    pub fn clamp(&self, t: f64) -> f64 {
        // max/min rather than f64::clamp: must not panic on a window the
        // authority published inverted
        t.max(self.start).min(self.end)
    }
}

/// Typed events forwarded from the time authority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeAuthorityEvent {
    ModeChanged(ClockMode),
    BoundsChanged(ClockBounds),
    /// Scrub/tick position in authority time
    Tick(f64),
}

// ============================================================================
// CLOCK SYNCHRONIZER
// ============================================================================

/// One instance per active render session.
pub struct ClockSync {
    config: ClockConfig,
    mode: ClockMode,
    bounds: ClockBounds,

    /// Scrub position while FIXED
    fixed_time: f64,

    /// Newest accepted live sample time across the session's tracks
    latest_sample_time: Option<f64>,

    torn_down: bool,
}

impl ClockSync {
    pub fn new(config: ClockConfig, mode: ClockMode, bounds: ClockBounds) -> Self {
        Self {
            config,
            mode,
            fixed_time: bounds.end,
            bounds,
            latest_sample_time: None,
            torn_down: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            ClockConfig::default(),
            ClockMode::Realtime,
            ClockBounds { start: 0.0, end: 0.0 },
        )
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn bounds(&self) -> ClockBounds {
        self.bounds
    }

    pub fn lag_buffer(&self) -> f64 {
        self.config.lag_buffer
    }

    pub fn latest_sample_time(&self) -> Option<f64> {
        self.latest_sample_time
    }

    /// Handle one authority event. Ignored after teardown.
    pub fn handle_event(&mut self, event: TimeAuthorityEvent) {
        if self.torn_down {
            return;
        }
        match event {
            TimeAuthorityEvent::ModeChanged(mode) => {
                if mode != self.mode {
                    log::debug!("clock mode {:?} -> {:?}", self.mode, mode);
                    self.mode = mode;
                    if mode == ClockMode::Fixed {
                        // Entering a scrub window starts at its end
                        self.fixed_time = self.bounds.end;
                    }
                }
            }
            TimeAuthorityEvent::BoundsChanged(bounds) => {
                // A degenerate window keeps the last valid one, like a
                // rejected sensor edit keeps the last valid definition
                if !bounds.is_valid() {
                    log::warn!(
                        "ignoring degenerate clock bounds [{}, {}]",
                        bounds.start,
                        bounds.end
                    );
                    return;
                }
                self.bounds = bounds;
                match self.mode {
                    // Scrub window moved: snap to its end
                    ClockMode::Fixed => self.fixed_time = bounds.end,
                    // Realtime keeps running; snapping would stutter
                    ClockMode::Realtime => {}
                }
            }
            TimeAuthorityEvent::Tick(t) => {
                if self.mode == ClockMode::Fixed {
                    self.fixed_time = self.bounds.clamp(t);
                }
                // Realtime ticks only pace the frame loop; render time is
                // derived from the live feed, never from wall time directly
            }
        }
    }

    /// Record an accepted live sample. Called by the ingest pipeline; the
    /// realtime render clock is derived from this.
    pub fn note_live_sample(&mut self, t: f64) {
        if self.torn_down {
            return;
        }
        match self.latest_sample_time {
            Some(latest) if latest >= t => {}
            _ => self.latest_sample_time = Some(t),
        }
    }

    /// Render clock time consumed once per frame.
    ///
    /// REALTIME: `latest accepted sample - lag buffer`, never ahead of the
    /// live feed; `None` until the first sample arrives. FIXED: the scrub
    /// position clamped to the window.
    pub fn render_time(&self) -> Option<f64> {
        if self.torn_down {
            return None;
        }
        match self.mode {
            ClockMode::Realtime => self
                .latest_sample_time
                .map(|t| t - self.config.lag_buffer),
            ClockMode::Fixed => Some(self.bounds.clamp(self.fixed_time)),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Synchronously detach from the authority. Every later event and
    /// sample notification is a no-op.
    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.latest_sample_time = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn realtime_clock(lag: f64) -> ClockSync {
        ClockSync::new(
            ClockConfig { lag_buffer: lag },
            ClockMode::Realtime,
            ClockBounds { start: 0.0, end: 100.0 },
        )
    }

    #[test]
    fn test_realtime_trails_latest_sample_scenario_e() {
        let mut clock = realtime_clock(3.0);
        assert_eq!(clock.render_time(), None);

        clock.note_live_sample(100.0);
        assert_relative_eq!(clock.render_time().unwrap(), 97.0);

        clock.note_live_sample(105.0);
        assert_relative_eq!(clock.render_time().unwrap(), 102.0);

        // Render clock never advances past latest - lag
        assert!(clock.render_time().unwrap() < clock.latest_sample_time().unwrap());
    }

    #[test]
    fn test_stale_sample_never_rewinds_clock() {
        let mut clock = realtime_clock(3.0);
        clock.note_live_sample(100.0);
        clock.note_live_sample(90.0);
        assert_relative_eq!(clock.render_time().unwrap(), 97.0);
    }

    #[test]
    fn test_fixed_bounds_change_snaps_to_end() {
        let mut clock = realtime_clock(3.0);
        clock.handle_event(TimeAuthorityEvent::ModeChanged(ClockMode::Fixed));
        assert_relative_eq!(clock.render_time().unwrap(), 100.0);

        clock.handle_event(TimeAuthorityEvent::BoundsChanged(ClockBounds {
            start: 200.0,
            end: 260.0,
        }));
        assert_relative_eq!(clock.render_time().unwrap(), 260.0);
    }

    #[test]
    fn test_degenerate_bounds_ignored_without_panic() {
        let mut clock = realtime_clock(3.0);
        clock.handle_event(TimeAuthorityEvent::ModeChanged(ClockMode::Fixed));
        clock.handle_event(TimeAuthorityEvent::BoundsChanged(ClockBounds {
            start: 200.0,
            end: 260.0,
        }));

        // Inverted window from the authority: last valid one is kept
        clock.handle_event(TimeAuthorityEvent::BoundsChanged(ClockBounds {
            start: 10.0,
            end: 5.0,
        }));
        assert_relative_eq!(clock.render_time().unwrap(), 260.0);

        // Non-finite window likewise
        clock.handle_event(TimeAuthorityEvent::BoundsChanged(ClockBounds {
            start: f64::NAN,
            end: 300.0,
        }));
        assert_relative_eq!(clock.render_time().unwrap(), 260.0);
        assert_eq!(clock.bounds(), ClockBounds { start: 200.0, end: 260.0 });
    }

    #[test]
    fn test_realtime_bounds_change_does_not_snap() {
        let mut clock = realtime_clock(3.0);
        clock.note_live_sample(50.0);
        let before = clock.render_time().unwrap();

        clock.handle_event(TimeAuthorityEvent::BoundsChanged(ClockBounds {
            start: 0.0,
            end: 9000.0,
        }));
        assert_relative_eq!(clock.render_time().unwrap(), before);
    }

    #[test]
    fn test_fixed_tick_scrubs_within_bounds() {
        let mut clock = realtime_clock(3.0);
        clock.handle_event(TimeAuthorityEvent::ModeChanged(ClockMode::Fixed));

        clock.handle_event(TimeAuthorityEvent::Tick(40.0));
        assert_relative_eq!(clock.render_time().unwrap(), 40.0);

        // Clamped to the window
        clock.handle_event(TimeAuthorityEvent::Tick(-10.0));
        assert_relative_eq!(clock.render_time().unwrap(), 0.0);
        clock.handle_event(TimeAuthorityEvent::Tick(500.0));
        assert_relative_eq!(clock.render_time().unwrap(), 100.0);
    }

    #[test]
    fn test_realtime_tick_does_not_drive_render_time() {
        let mut clock = realtime_clock(3.0);
        clock.note_live_sample(80.0);
        clock.handle_event(TimeAuthorityEvent::Tick(9999.0));
        assert_relative_eq!(clock.render_time().unwrap(), 77.0);
    }

    #[test]
    fn test_teardown_silences_everything() {
        let mut clock = realtime_clock(3.0);
        clock.note_live_sample(100.0);
        clock.teardown();

        assert_eq!(clock.render_time(), None);
        clock.handle_event(TimeAuthorityEvent::ModeChanged(ClockMode::Fixed));
        clock.note_live_sample(200.0);
        assert_eq!(clock.render_time(), None);
        assert!(clock.is_torn_down());
    }
}
