//! Frame analysis primitives shared by the detectors.
//!
//! Frames are reduced to a coarse luma grid before any comparison, which keeps
//! per-frame cost independent of the camera resolution. Detectors build on:
//!
//! - [`ActivityMask`]: cells that changed between two grids (frame difference)
//!   or that differ from a learned [`BackgroundModel`]
//! - [`ColorSignature`]: mean colour and a coarse colour histogram of the
//!   frame centre
//! - [`Ema`] and [`Sustained`]: smoothing and hysteresis

use crate::buffer::HistoryView;
use crate::frame::Frame;
use std::collections::VecDeque;
use std::time::Duration;

/// Grid width used for activity analysis.
pub const GRID_COLS: u32 = 32;

/// Grid height used for activity analysis.
pub const GRID_ROWS: u32 = 24;

/// Luma difference for a cell to count as changed (0-255 scale).
pub const DIFF_THRESHOLD: f32 = 25.0;

/// Samples taken per cell side; larger blocks are subsampled.
const SAMPLES_PER_CELL_SIDE: u32 = 8;

/// Map a 0-100 sensitivity linearly onto a threshold multiplier.
///
/// 0 gives 1.5x the nominal threshold, 50 gives the nominal threshold and 100
/// gives half of it.
pub fn sensitivity_scale(sensitivity: u8) -> f32 {
    1.5 - f32::from(sensitivity.min(100)) / 100.0
}

/// Average luma over a coarse grid of cells.
#[derive(Debug, Clone, PartialEq)]
pub struct LumaGrid {
    cols: u32,
    rows: u32,
    cells: Vec<f32>,
}

impl LumaGrid {
    pub fn from_frame(frame: &Frame) -> Self {
        let cols = GRID_COLS.min(frame.width);
        let rows = GRID_ROWS.min(frame.height);
        let mut cells = Vec::with_capacity((cols * rows) as usize);

        for row in 0..rows {
            let y0 = row * frame.height / rows;
            let y1 = ((row + 1) * frame.height / rows).max(y0 + 1);
            let step_y = ((y1 - y0) / SAMPLES_PER_CELL_SIDE).max(1);

            for col in 0..cols {
                let x0 = col * frame.width / cols;
                let x1 = ((col + 1) * frame.width / cols).max(x0 + 1);
                let step_x = ((x1 - x0) / SAMPLES_PER_CELL_SIDE).max(1);

                let mut sum = 0.0f32;
                let mut samples = 0u32;
                let mut y = y0;
                while y < y1 {
                    let mut x = x0;
                    while x < x1 {
                        sum += luma(frame.pixel(x, y));
                        samples += 1;
                        x += step_x;
                    }
                    y += step_y;
                }
                cells.push(sum / samples as f32);
            }
        }

        Self { cols, rows, cells }
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn same_shape(&self, other: &LumaGrid) -> bool {
        self.cols == other.cols && self.rows == other.rows
    }
}

#[inline]
fn luma(rgb: [u8; 3]) -> f32 {
    0.299 * f32::from(rgb[0]) + 0.587 * f32::from(rgb[1]) + 0.114 * f32::from(rgb[2])
}

/// Boolean mask of active cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityMask {
    cols: u32,
    rows: u32,
    active: Vec<bool>,
}

/// A connected group of active cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub cells: usize,
    pub center: (f32, f32),
}

impl ActivityMask {
    /// Cells whose luma changed by more than `threshold` between two grids.
    ///
    /// Returns `None` when the grids have different shapes.
    pub fn between(previous: &LumaGrid, current: &LumaGrid, threshold: f32) -> Option<Self> {
        if !previous.same_shape(current) {
            return None;
        }
        let active = previous
            .cells
            .iter()
            .zip(&current.cells)
            .map(|(a, b)| (a - b).abs() > threshold)
            .collect();
        Some(Self {
            cols: current.cols,
            rows: current.rows,
            active,
        })
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// Percentage of active cells over the whole grid.
    pub fn activity_percent(&self) -> f32 {
        if self.active.is_empty() {
            return 0.0;
        }
        self.active_count() as f32 * 100.0 / self.active.len() as f32
    }

    /// Active cells within rows `[start, end)`.
    pub fn active_in_rows(&self, start: u32, end: u32) -> usize {
        let end = end.min(self.rows);
        if start >= end {
            return 0;
        }
        let from = (start * self.cols) as usize;
        let to = (end * self.cols) as usize;
        self.active[from..to].iter().filter(|a| **a).count()
    }

    /// Percentage of active cells within rows `[start, end)`.
    pub fn rows_percent(&self, start: u32, end: u32) -> f32 {
        let end = end.min(self.rows);
        if start >= end {
            return 0.0;
        }
        let total = ((end - start) * self.cols) as f32;
        self.active_in_rows(start, end) as f32 * 100.0 / total
    }

    /// Number of top rows covering `percent` of the frame height, at least one.
    pub fn top_rows(&self, percent: u8) -> u32 {
        ((self.rows * u32::from(percent)).div_ceil(100)).clamp(1, self.rows)
    }

    /// Active cell counts per region of an `n x n` split, row major.
    pub fn region_counts(&self, n: u32) -> Vec<usize> {
        let n = n.max(1);
        let mut counts = vec![0usize; (n * n) as usize];
        for row in 0..self.rows {
            for col in 0..self.cols {
                if self.active[(row * self.cols + col) as usize] {
                    let region_row = (row * n / self.rows).min(n - 1);
                    let region_col = (col * n / self.cols).min(n - 1);
                    counts[(region_row * n + region_col) as usize] += 1;
                }
            }
        }
        counts
    }

    /// Four-connected components of at least `min_cells` cells.
    pub fn blobs(&self, min_cells: usize) -> Vec<Blob> {
        let mut visited = vec![false; self.active.len()];
        let mut blobs = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.active.len() {
            if !self.active[start] || visited[start] {
                continue;
            }

            visited[start] = true;
            stack.push(start);
            let mut cells = 0usize;
            let (mut sum_x, mut sum_y) = (0.0f32, 0.0f32);

            while let Some(idx) = stack.pop() {
                cells += 1;
                let col = idx as u32 % self.cols;
                let row = idx as u32 / self.cols;
                sum_x += col as f32;
                sum_y += row as f32;

                let mut visit = |c: u32, r: u32| {
                    let n = (r * self.cols + c) as usize;
                    if self.active[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if col > 0 {
                    visit(col - 1, row);
                }
                if col + 1 < self.cols {
                    visit(col + 1, row);
                }
                if row > 0 {
                    visit(col, row - 1);
                }
                if row + 1 < self.rows {
                    visit(col, row + 1);
                }
            }

            if cells >= min_cells {
                blobs.push(Blob {
                    cells,
                    center: (sum_x / cells as f32, sum_y / cells as f32),
                });
            }
        }

        blobs
    }
}

/// Frame-difference activity with a cached previous grid.
///
/// The cache is only trusted when it belongs to the frame right before the
/// current one in the buffer; otherwise the previous grid is rebuilt from
/// history.
#[derive(Debug, Default)]
pub struct MotionTracker {
    last: Option<(u64, LumaGrid)>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activity mask between the previous buffered frame and `frame`.
    ///
    /// `None` for the first frame or after a resolution change.
    pub fn observe(&mut self, frame: &Frame, history: &HistoryView<'_>) -> Option<ActivityMask> {
        let current = LumaGrid::from_frame(frame);

        let previous = match (history.previous(), self.last.take()) {
            (Some(prev), Some((seq, grid))) if seq == prev.sequence => Some(grid),
            (Some(prev), _) => Some(LumaGrid::from_frame(prev)),
            (None, _) => None,
        };

        let mask = previous.and_then(|p| ActivityMask::between(&p, &current, DIFF_THRESHOLD));
        self.last = Some((frame.sequence, current));
        mask
    }
}

/// Slowly adapting per-cell background estimate.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    learning_rate: f32,
    cells: Option<LumaGrid>,
}

impl BackgroundModel {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            cells: None,
        }
    }

    /// Foreground mask of `grid` against the model, then learn from `grid`.
    ///
    /// The first grid (or one of a new shape) seeds the model and has no
    /// foreground.
    pub fn apply(&mut self, grid: &LumaGrid) -> ActivityMask {
        match &mut self.cells {
            Some(background) if background.same_shape(grid) => {
                let mask = ActivityMask::between(background, grid, DIFF_THRESHOLD)
                    .unwrap_or_else(|| empty_mask(grid));
                for (bg, value) in background.cells.iter_mut().zip(&grid.cells) {
                    *bg += (value - *bg) * self.learning_rate;
                }
                mask
            }
            _ => {
                self.cells = Some(grid.clone());
                empty_mask(grid)
            }
        }
    }

    pub fn reset(&mut self) {
        self.cells = None;
    }
}

fn empty_mask(grid: &LumaGrid) -> ActivityMask {
    ActivityMask {
        cols: grid.cols,
        rows: grid.rows,
        active: vec![false; grid.cells.len()],
    }
}

/// Number of histogram levels per channel.
const HISTOGRAM_LEVELS: usize = 4;

/// Colour distribution of the centre of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorSignature {
    /// Mean RGB
    pub mean: [f32; 3],
    /// Normalized joint RGB histogram, 4 levels per channel
    pub histogram: [f32; 64],
}

impl ColorSignature {
    /// Signature of the central half of the frame (edges are often glass,
    /// stand or wall).
    pub fn from_frame(frame: &Frame) -> Self {
        let (x0, x1) = centre_span(frame.width);
        let (y0, y1) = centre_span(frame.height);
        let step_x = ((x1 - x0) / 64).max(1);
        let step_y = ((y1 - y0) / 48).max(1);

        let mut sum = [0.0f64; 3];
        let mut histogram = [0.0f32; 64];
        let mut samples = 0u32;

        let mut y = y0;
        while y < y1 {
            let mut x = x0;
            while x < x1 {
                let [r, g, b] = frame.pixel(x, y);
                sum[0] += f64::from(r);
                sum[1] += f64::from(g);
                sum[2] += f64::from(b);
                let bin = (usize::from(r) >> 6) * HISTOGRAM_LEVELS * HISTOGRAM_LEVELS
                    + (usize::from(g) >> 6) * HISTOGRAM_LEVELS
                    + (usize::from(b) >> 6);
                histogram[bin] += 1.0;
                samples += 1;
                x += step_x;
            }
            y += step_y;
        }

        let n = samples.max(1) as f32;
        for bin in histogram.iter_mut() {
            *bin /= n;
        }
        let n = f64::from(samples.max(1));
        Self {
            mean: [
                (sum[0] / n) as f32,
                (sum[1] / n) as f32,
                (sum[2] / n) as f32,
            ],
            histogram,
        }
    }

    /// Average of several signatures.
    pub fn average(signatures: &[ColorSignature]) -> Option<Self> {
        if signatures.is_empty() {
            return None;
        }
        let n = signatures.len() as f32;
        let mut mean = [0.0f32; 3];
        let mut histogram = [0.0f32; 64];
        for sig in signatures {
            for (m, v) in mean.iter_mut().zip(sig.mean) {
                *m += v / n;
            }
            for (h, v) in histogram.iter_mut().zip(sig.histogram) {
                *h += v / n;
            }
        }
        Some(Self { mean, histogram })
    }

    /// Euclidean distance between mean colours (0 to ~441).
    pub fn mean_distance(&self, other: &ColorSignature) -> f32 {
        self.mean
            .iter()
            .zip(other.mean)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Half the L1 distance between histograms (0 = identical, 1 = disjoint).
    pub fn histogram_drift(&self, other: &ColorSignature) -> f32 {
        0.5 * self
            .histogram
            .iter()
            .zip(other.histogram)
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
    }

    /// Move this signature toward `other` by `rate`.
    pub fn blend(&mut self, other: &ColorSignature, rate: f32) {
        for (m, v) in self.mean.iter_mut().zip(other.mean) {
            *m += (v - *m) * rate;
        }
        for (h, v) in self.histogram.iter_mut().zip(other.histogram) {
            *h += (v - *h) * rate;
        }
    }
}

fn centre_span(len: u32) -> (u32, u32) {
    let start = len / 4;
    let end = (3 * len / 4).max(start + 1).min(len);
    (start.min(end - 1), end)
}

/// Exponential moving average.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(v) => v + self.alpha * (sample - v),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Hysteresis for a condition that must hold for a minimum duration.
///
/// Reports once per continuous run of the condition; the run must break
/// before it can report again.
#[derive(Debug, Clone)]
pub struct Sustained {
    min: Duration,
    since: Option<Duration>,
    reported: bool,
}

impl Sustained {
    pub fn new(min: Duration) -> Self {
        Self {
            min,
            since: None,
            reported: false,
        }
    }

    pub fn from_secs(secs: f64) -> Self {
        Self::new(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Feed the condition at `now`; returns how long it has held when the
    /// minimum duration is first reached.
    pub fn update(&mut self, condition: bool, now: Duration) -> Option<Duration> {
        if !condition {
            self.since = None;
            self.reported = false;
            return None;
        }

        let since = *self.since.get_or_insert(now);
        let held = now.saturating_sub(since);
        if !self.reported && held >= self.min {
            self.reported = true;
            return Some(held);
        }
        None
    }

    /// Whether the condition is currently held.
    pub fn active(&self) -> bool {
        self.since.is_some()
    }

    pub fn min(&self) -> Duration {
        self.min
    }
}

/// Time a baseline has been learning, from the first observed frame.
#[derive(Debug, Clone)]
pub struct Warmup {
    duration: Duration,
    started: Option<Duration>,
}

impl Warmup {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: None,
        }
    }

    /// Record an observation at `now` and report whether warm-up is over.
    pub fn observe(&mut self, now: Duration) -> bool {
        let started = *self.started.get_or_insert(now);
        now.saturating_sub(started) >= self.duration
    }
}

/// Most frequent value over a sliding window.
#[derive(Debug, Clone)]
pub struct ModeWindow {
    capacity: usize,
    values: VecDeque<usize>,
}

impl ModeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, value: usize) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Mode of the window; ties go to the most recent value.
    pub fn mode(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for value in self.values.iter().rev() {
            let count = self.values.iter().filter(|v| *v == value).count();
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((*value, count));
            }
        }
        best.map(|(value, _)| value)
    }
}
