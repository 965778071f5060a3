//! Visible index range over the displayed series
//!
//! The controller owns the only mutable state of the pipeline: `{start, end}` (inclusive)
//! into whichever series is displayed. Every operation clamps, none fails. Once the series
//! holds at least `min_span` points the viewport always spans at least `min_span` points;
//! shorter series are shown whole.

use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Inclusive index range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Viewport {
    pub start: usize,
    pub end: usize,
}

impl Viewport {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of points covered
    pub fn span(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index <= self.end
    }

    /// Integer midpoint used as the zoom anchor
    pub fn midpoint(&self) -> usize {
        self.start + (self.end - self.start) / 2
    }
}

/// Zoom / pan tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSettings {
    pub min_span: usize,
    pub zoom_in_factor: f64,
    pub zoom_out_factor: f64,
    pub jump_window: usize,
    pub pan_speed: f64,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ViewportSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_span: config.min_span.max(1),
            zoom_in_factor: config.zoom_in_factor,
            zoom_out_factor: config.zoom_out_factor,
            jump_window: config.jump_window,
            pan_speed: config.pan_speed,
        }
    }
}

/// Owns the viewport over a series of `len` points
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportController {
    len: usize,
    viewport: Option<Viewport>,
    settings: ViewportSettings,
}

impl ViewportController {
    /// Controller showing the whole series
    pub fn new(len: usize, settings: ViewportSettings) -> Self {
        let mut controller = Self {
            len,
            viewport: None,
            settings,
        };
        controller.reset();
        controller
    }

    /// Controller restoring a previous viewport, clamped to the new length
    pub fn restore(len: usize, settings: ViewportSettings, previous: Option<Viewport>) -> Self {
        let mut controller = Self::new(len, settings);
        if let Some(previous) = previous {
            controller.viewport = controller.place(previous.start as isize, previous.span());
        }
        controller
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adopt a new series length. A viewport showing the whole series keeps showing the
    /// whole series; otherwise start and span are preserved as far as they fit.
    pub fn resize(&mut self, len: usize) {
        let was_full = self.is_full();
        let previous = self.viewport;
        self.len = len;

        self.viewport = match previous {
            Some(previous) if !was_full => self.place(previous.start as isize, previous.span()),
            _ => self.full(),
        };
    }

    /// Show every point
    pub fn reset(&mut self) {
        self.viewport = self.full();
    }

    pub fn zoom_in(&mut self) {
        self.zoom(self.settings.zoom_in_factor);
    }

    pub fn zoom_out(&mut self) {
        self.zoom(self.settings.zoom_out_factor);
    }

    /// Scale the span by `factor` around the current midpoint
    pub fn zoom(&mut self, factor: f64) {
        let Some(current) = self.viewport else {
            return;
        };
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }

        let span = ((current.span() as f64 * factor).floor() as usize).max(self.settings.min_span);
        let start = current.midpoint() as isize - (span / 2) as isize;
        self.viewport = self.place(start, span);
        debug!(factor, viewport = ?self.viewport, "zoomed viewport");
    }

    /// Center a `jump_window` sized viewport on `index`
    pub fn jump_to(&mut self, index: usize) {
        if self.len == 0 {
            return;
        }
        let index = index.min(self.len - 1);
        let span = self.settings.jump_window.max(self.settings.min_span);
        self.viewport = self.place(index as isize - (span / 2) as isize, span);
    }

    /// Center on the point closest to `now`
    pub fn jump_to_now(&mut self, times: &[DateTime<Utc>], now: DateTime<Utc>) {
        if let Some(index) = closest_index(times, now) {
            self.jump_to(index);
        }
    }

    /// Shift the viewport by a drag of `delta_pixels` across a container `width` pixels
    /// wide. Dragging right (positive delta) reveals earlier points.
    pub fn pan(&mut self, delta_pixels: f64, width: f64) {
        let Some(current) = self.viewport else {
            return;
        };
        if !width.is_finite() || width <= 0.0 || !delta_pixels.is_finite() {
            return;
        }

        // A shift past either end of the series is equivalent to landing on that end
        let limit = self.len as f64;
        let index_delta = (delta_pixels * (self.len as f64 / width) * self.settings.pan_speed)
            .round()
            .clamp(-limit, limit) as isize;
        if index_delta == 0 {
            return;
        }

        let start = (current.start as isize).saturating_sub(index_delta);
        self.viewport = self.place(start, current.span());
    }

    /// Accept a brush selection, clamped to the series and widened to the minimum span
    pub fn set(&mut self, start: usize, end: usize) {
        if self.len == 0 {
            return;
        }
        let last = self.len - 1;
        let (start, end) = (start.min(last), end.min(last));
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        self.viewport = self.place(start as isize, end - start + 1);
    }

    fn is_full(&self) -> bool {
        self.viewport.is_none() || self.viewport == self.full()
    }

    fn full(&self) -> Option<Viewport> {
        (self.len > 0).then(|| Viewport::new(0, self.len - 1))
    }

    /// Fit a viewport of `span` points starting at `start` into the series, shifting it
    /// rather than shrinking it when it overhangs either end.
    fn place(&self, start: isize, span: usize) -> Option<Viewport> {
        if self.len == 0 {
            return None;
        }

        let span = span.max(self.settings.min_span).min(self.len);
        let max_start = (self.len - span) as isize;
        let start = start.clamp(0, max_start) as usize;

        Some(Viewport::new(start, start + span - 1))
    }
}

/// Index of the timestamp closest to `now`; ties resolve to the earlier index.
pub fn closest_index(times: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<usize> {
    times
        .iter()
        .enumerate()
        .min_by_key(|(_, time)| (**time - now).num_milliseconds().unsigned_abs())
        .map(|(index, _)| index)
}
