//! Render statistics.
//!
//! [`RenderStatsTracker`] brackets each frame with `frame_start` /
//! `frame_end`. Per-frame counters reset at frame start; resource counters
//! follow explicit create/destroy records and survive across frames. Frame
//! times go into a bounded window from which the moving average and FPS are
//! derived.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;

pub const DEFAULT_STATS_WINDOW: usize = 60;
pub const MAX_STATS_WINDOW: usize = 120;
pub const MINIMUM_FPS: f64 = 30.0;
pub const TARGET_FPS: f64 = 60.0;

/// Snapshot of the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderStats {
    /// Frames completed since creation or the last reset.
    pub frame: u64,
    pub draw_calls: u32,
    pub triangles: u64,
    pub vertices: u64,
    pub points: u64,
    pub lines: u64,

    pub geometries: u32,
    pub buffers: u32,
    pub textures: u32,
    pub shaders: u32,
    pub buffer_memory: u64,
    pub texture_memory: u64,

    /// Duration of the most recent frame in milliseconds.
    pub frame_time_ms: f64,
    pub avg_frame_time_ms: f64,
    pub fps: f64,
}

assert_impl_all!(RenderStats: Send, Sync, Copy);

impl RenderStats {
    pub fn total_memory(&self) -> u64 {
        self.buffer_memory + self.texture_memory
    }

    pub fn meets_minimum_fps(&self) -> bool {
        self.fps >= MINIMUM_FPS
    }

    pub fn meets_target_fps(&self) -> bool {
        self.fps >= TARGET_FPS
    }
}

#[derive(Debug)]
pub struct RenderStatsTracker {
    stats: RenderStats,
    window: usize,
    frame_times: VecDeque<Duration>,
    frame_started: Option<Instant>,
}

impl Default for RenderStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderStatsTracker {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_STATS_WINDOW)
    }

    /// Average over `window` frames, clamped to `1..=120`.
    pub fn with_window(window: usize) -> Self {
        let window = window.clamp(1, MAX_STATS_WINDOW);
        Self {
            stats: RenderStats::default(),
            window,
            frame_times: VecDeque::with_capacity(window),
            frame_started: None,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn frame_start(&mut self) {
        self.frame_start_at(Instant::now());
    }

    /// Reset the per-frame counters and remember when the frame began.
    pub fn frame_start_at(&mut self, now: Instant) {
        self.stats.draw_calls = 0;
        self.stats.triangles = 0;
        self.stats.vertices = 0;
        self.stats.points = 0;
        self.stats.lines = 0;
        self.frame_started = Some(now);
    }

    pub fn frame_end(&mut self) {
        self.frame_end_at(Instant::now());
    }

    /// Close the frame opened by the last `frame_start`. Ignored when no
    /// frame is open.
    pub fn frame_end_at(&mut self, now: Instant) {
        let Some(started) = self.frame_started.take() else {
            log::trace!("frame_end without frame_start");
            return;
        };
        self.record_frame_time(now.saturating_duration_since(started));
    }

    /// Count a finished frame that took `elapsed`.
    pub fn record_frame_time(&mut self, elapsed: Duration) {
        self.stats.frame += 1;
        self.frame_times.push_back(elapsed);
        while self.frame_times.len() > self.window {
            self.frame_times.pop_front();
        }

        let total: Duration = self.frame_times.iter().sum();
        let avg_ms = total.as_secs_f64() * 1000.0 / self.frame_times.len() as f64;
        self.stats.frame_time_ms = elapsed.as_secs_f64() * 1000.0;
        self.stats.avg_frame_time_ms = avg_ms;
        self.stats.fps = if avg_ms > 0.0 { 1000.0 / avg_ms } else { 0.0 };
    }

    pub fn record_draw_call(&mut self, triangles: u64) {
        self.stats.draw_calls += 1;
        self.stats.triangles += triangles;
        self.stats.vertices += triangles * 3;
    }

    pub fn record_points(&mut self, points: u64) {
        self.stats.draw_calls += 1;
        self.stats.points += points;
    }

    pub fn record_lines(&mut self, lines: u64) {
        self.stats.draw_calls += 1;
        self.stats.lines += lines;
    }

    pub fn record_buffer_allocated(&mut self, bytes: u64) {
        self.stats.buffers += 1;
        self.stats.buffer_memory += bytes;
    }

    pub fn record_buffer_deallocated(&mut self, bytes: u64) {
        self.stats.buffers = self.stats.buffers.saturating_sub(1);
        self.stats.buffer_memory = self.stats.buffer_memory.saturating_sub(bytes);
    }

    pub fn record_texture_created(&mut self, bytes: u64) {
        self.stats.textures += 1;
        self.stats.texture_memory += bytes;
    }

    pub fn record_texture_disposed(&mut self, bytes: u64) {
        self.stats.textures = self.stats.textures.saturating_sub(1);
        self.stats.texture_memory = self.stats.texture_memory.saturating_sub(bytes);
    }

    pub fn record_shader_created(&mut self) {
        self.stats.shaders += 1;
    }

    pub fn record_shader_disposed(&mut self) {
        self.stats.shaders = self.stats.shaders.saturating_sub(1);
    }

    pub fn record_geometry_created(&mut self) {
        self.stats.geometries += 1;
    }

    pub fn record_geometry_disposed(&mut self) {
        self.stats.geometries = self.stats.geometries.saturating_sub(1);
    }

    /// Zero the resource counters, e.g. after device loss dropped every
    /// resource at once.
    pub fn clear_resources(&mut self) {
        self.stats.geometries = 0;
        self.stats.buffers = 0;
        self.stats.textures = 0;
        self.stats.shaders = 0;
        self.stats.buffer_memory = 0;
        self.stats.texture_memory = 0;
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Forget everything, including the frame-time window.
    pub fn reset(&mut self) {
        self.stats = RenderStats::default();
        self.frame_times.clear();
        self.frame_started = None;
    }

    pub fn summary(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "=== Render Statistics ===");
        let _ = writeln!(out, "Frame: {}", s.frame);
        let _ = writeln!(out, "FPS: {:.1}", s.fps);
        let _ = writeln!(
            out,
            "Frame Time: {:.2}ms (avg: {:.2}ms)",
            s.frame_time_ms, s.avg_frame_time_ms
        );
        let _ = writeln!(out, "Draw Calls: {}", s.draw_calls);
        let _ = writeln!(out, "Triangles: {}", s.triangles);
        let _ = writeln!(out, "Vertices: {}", s.vertices);
        let _ = writeln!(out, "Geometries: {}", s.geometries);
        let _ = writeln!(out, "Buffers: {}", s.buffers);
        let _ = writeln!(out, "Textures: {}", s.textures);
        let _ = writeln!(out, "Shaders: {}", s.shaders);
        let _ = writeln!(out, "Memory:");
        let _ = writeln!(out, "  - Buffers: {}", format_bytes(s.buffer_memory));
        let _ = writeln!(out, "  - Textures: {}", format_bytes(s.texture_memory));
        let _ = writeln!(out, "  - Total: {}", format_bytes(s.total_memory()));
        out
    }
}

/// Whole bytes, KB or MB, truncated.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    match bytes {
        b if b < KB => format!("{} B", b),
        b if b < MB => format!("{} KB", b / KB),
        b => format!("{} MB", b / MB),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_clamped() {
        assert_eq!(RenderStatsTracker::with_window(0).window(), 1);
        assert_eq!(RenderStatsTracker::with_window(500).window(), MAX_STATS_WINDOW);
        assert_eq!(RenderStatsTracker::new().window(), DEFAULT_STATS_WINDOW);
    }

    #[test]
    fn test_frame_counters_reset_at_frame_start() {
        let mut tracker = RenderStatsTracker::new();
        let t0 = Instant::now();
        tracker.frame_start_at(t0);
        tracker.record_draw_call(2);
        tracker.record_points(10);
        tracker.record_lines(4);
        tracker.frame_end_at(t0 + Duration::from_millis(10));

        let stats = tracker.stats();
        assert_eq!(stats.draw_calls, 3);
        assert_eq!((stats.triangles, stats.vertices), (2, 6));
        assert_eq!((stats.points, stats.lines), (10, 4));

        tracker.frame_start_at(t0 + Duration::from_millis(10));
        assert_eq!(tracker.stats().draw_calls, 0);
        assert_eq!(tracker.stats().frame, 1);
    }

    #[test]
    fn test_moving_average_uses_window() {
        let mut tracker = RenderStatsTracker::with_window(2);
        for ms in [10, 20, 40] {
            tracker.record_frame_time(Duration::from_millis(ms));
        }
        let stats = tracker.stats();
        assert_eq!(stats.frame, 3);
        assert!((stats.avg_frame_time_ms - 30.0).abs() < 1e-9);
        assert!((stats.frame_time_ms - 40.0).abs() < 1e-9);
        assert!((stats.fps - 1000.0 / 30.0).abs() < 1e-9);
        assert!(stats.meets_minimum_fps());
        assert!(!stats.meets_target_fps());
    }

    #[test]
    fn test_fps_thresholds() {
        let mut tracker = RenderStatsTracker::new();
        assert_eq!(tracker.stats().fps, 0.0);
        tracker.record_frame_time(Duration::from_micros(16_000));
        assert!(tracker.stats().meets_target_fps());
        tracker.reset();
        tracker.record_frame_time(Duration::from_millis(50));
        assert!(!tracker.stats().meets_minimum_fps());
    }

    #[test]
    fn test_frame_end_without_start_is_ignored() {
        let mut tracker = RenderStatsTracker::new();
        tracker.frame_end();
        assert_eq!(tracker.stats().frame, 0);
    }

    #[test]
    fn test_resource_counters_persist() {
        let mut tracker = RenderStatsTracker::new();
        tracker.record_buffer_allocated(2048);
        tracker.record_buffer_allocated(1024);
        tracker.record_texture_created(4 * 1024 * 1024);
        tracker.record_shader_created();
        tracker.record_geometry_created();
        tracker.frame_start();
        tracker.record_buffer_deallocated(1024);

        let stats = tracker.stats();
        assert_eq!(stats.buffers, 1);
        assert_eq!(stats.buffer_memory, 2048);
        assert_eq!(stats.total_memory(), 2048 + 4 * 1024 * 1024);
        assert_eq!((stats.shaders, stats.geometries, stats.textures), (1, 1, 1));

        tracker.record_shader_disposed();
        tracker.record_shader_disposed();
        assert_eq!(tracker.stats().shaders, 0);
    }

    #[test]
    fn test_summary_formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 + 5), "3 MB");

        let mut tracker = RenderStatsTracker::new();
        tracker.record_texture_created(2048);
        let summary = tracker.summary();
        assert!(summary.starts_with("=== Render Statistics ==="));
        assert!(summary.contains("  - Textures: 2 KB"));
    }
}
