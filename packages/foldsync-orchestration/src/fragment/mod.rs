//! Fragmenter: split over-length sequences into overlapping windows and
//! stitch per-window annotations back into one full-length record.
//!
//! Pure functions, no I/O. Window indices are 1-based everywhere outside
//! this module, matching the `F{n}` artifact naming.

pub mod aggregate;
pub mod recombine;

use std::ops::Range;

use serde::{Deserialize, Serialize};

pub use aggregate::{circular_mean, majority_vote, smooth, Aggregation};
pub use recombine::{PairObservation, Recombiner, ResidueObservation, WindowResult};

/// One window of a parent sequence. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// 1-based fragment index
    pub index: u32,
    /// Offset of the first residue in parent coordinates
    pub start: usize,
    /// Exclusive end in parent coordinates
    pub end: usize,
    pub sequence: String,
}

impl Window {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of windows `decompose` produces for a sequence of `length`
pub fn window_count(length: usize, window_size: usize, stride: usize) -> usize {
    if length <= window_size {
        1
    } else {
        let stride = stride.max(1);
        1 + (length - window_size).div_ceil(stride)
    }
}

/// Split `sequence` into windows of `window_size` starting every `stride`
/// residues. The last window ends at the sequence end and may be shorter.
pub fn decompose(sequence: &str, window_size: usize, stride: usize) -> Vec<Window> {
    let residues: Vec<char> = sequence.chars().collect();
    let length = residues.len();

    if length <= window_size {
        return vec![Window {
            index: 1,
            start: 0,
            end: length,
            sequence: sequence.to_string(),
        }];
    }

    let stride = stride.max(1);
    let mut windows = Vec::with_capacity(window_count(length, window_size, stride));
    let mut start = 0;
    loop {
        let end = (start + window_size).min(length);
        windows.push(Window {
            index: windows.len() as u32 + 1,
            start,
            end,
            sequence: residues[start..end].iter().collect(),
        });
        if end == length {
            break;
        }
        start += stride;
    }
    windows
}

/// Which positions of each window survive trimming near synthetic termini
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimPolicy {
    /// Split every overlap at its midpoint: exactly one contributor per position
    Midpoint,
    /// Drop `n` positions next to each synthetic terminus; survivors that
    /// still overlap are aggregated
    Margin(usize),
}

/// Window layout of one parent sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub length: usize,
    pub window_size: usize,
    pub stride: usize,
    pub total_windows: usize,
}

impl WindowGeometry {
    pub fn new(length: usize, window_size: usize, stride: usize) -> Self {
        Self {
            length,
            window_size,
            stride: stride.max(1),
            total_windows: window_count(length, window_size, stride),
        }
    }

    /// Parent-coordinate span of window `index` (1-based)
    pub fn span(&self, index: usize) -> Range<usize> {
        if self.total_windows == 1 {
            return 0..self.length;
        }
        let start = (index - 1) * self.stride;
        start..(start + self.window_size).min(self.length)
    }

    /// Parent-coordinate range of window `index` that survives trimming
    pub fn kept(&self, index: usize, policy: TrimPolicy) -> Range<usize> {
        let span = self.span(index);
        let first = index == 1;
        let last = index == self.total_windows;

        match policy {
            TrimPolicy::Midpoint => {
                let half_overlap = (self.window_size - self.stride) / 2;
                let lo = if first { span.start } else { span.start + half_overlap };
                let hi = if last {
                    span.end
                } else {
                    span.start + self.stride + half_overlap
                };
                lo..hi
            }
            TrimPolicy::Margin(margin) => {
                let lo = if first { span.start } else { span.start + margin };
                let hi = if last { span.end } else { span.end.saturating_sub(margin) };
                lo..hi.max(lo)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_sequence_single_window() {
        let windows = decompose("MKVLA", 10, 3);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].sequence, "MKVLA");
        assert_eq!((windows[0].start, windows[0].end), (0, 5));
    }

    #[test]
    fn test_exact_window_size_is_unfragmented() {
        let seq = "A".repeat(1400);
        assert_eq!(decompose(&seq, 1400, 200).len(), 1);
    }

    #[test]
    fn test_2671_residues_make_eight_windows() {
        let seq = "M".repeat(2671);
        let windows = decompose(&seq, 1400, 200);
        assert_eq!(windows.len(), 8);
        assert_eq!(window_count(2671, 1400, 200), 8);
        assert_eq!(windows[7].start, 1400);
        assert_eq!(windows[7].end, 2671);
        assert!(windows[7].len() < 1400);
        assert!(windows[..7].iter().all(|w| w.len() == 1400));
    }

    #[test]
    fn test_1600_residues_window_count() {
        // 1 + ceil(200 / 200)
        assert_eq!(decompose(&"A".repeat(1600), 1400, 200).len(), 2);
        assert_eq!(decompose(&"A".repeat(1601), 1400, 200).len(), 3);
    }

    #[test]
    fn test_windows_overlap_by_window_minus_stride() {
        let seq: String = (0..30).map(|i| (b'A' + (i % 20) as u8) as char).collect();
        let windows = decompose(&seq, 10, 4);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 6);
        }
    }

    #[test]
    fn test_midpoint_trim_partitions_1600() {
        let geometry = WindowGeometry::new(1600, 1400, 200);
        let a = geometry.kept(1, TrimPolicy::Midpoint);
        let b = geometry.kept(2, TrimPolicy::Midpoint);
        assert_eq!(a, 0..800);
        assert_eq!(b, 800..1600);
    }

    #[test]
    fn test_margin_trim_keeps_real_termini() {
        let geometry = WindowGeometry::new(2671, 1400, 200);
        assert_eq!(geometry.kept(1, TrimPolicy::Margin(200)), 0..1200);
        assert_eq!(geometry.kept(2, TrimPolicy::Margin(200)), 400..1400);
        assert_eq!(geometry.kept(8, TrimPolicy::Margin(200)), 1600..2671);
    }

    proptest! {
        #[test]
        fn prop_windows_cover_contiguously(
            length in 1usize..600,
            window_size in 2usize..120,
            stride_frac in 0.01f64..0.99,
        ) {
            let stride = ((window_size as f64 * stride_frac) as usize).clamp(1, window_size - 1);
            let seq = "A".repeat(length);
            let windows = decompose(&seq, window_size, stride);

            prop_assert_eq!(windows.len(), window_count(length, window_size, stride));
            prop_assert_eq!(windows[0].start, 0);
            prop_assert_eq!(windows.last().unwrap().end, length);
            for pair in windows.windows(2) {
                prop_assert_eq!(pair[1].start, pair[0].start + stride);
                prop_assert!(pair[1].start < pair[0].end);
            }
            for w in &windows {
                prop_assert!(w.len() <= window_size.max(length.min(window_size)));
            }
        }

        #[test]
        fn prop_midpoint_trim_has_one_contributor(
            length in 1usize..800,
            window_size in 2usize..150,
            stride_frac in 0.01f64..0.99,
        ) {
            let stride = ((window_size as f64 * stride_frac) as usize).clamp(1, window_size - 1);
            let geometry = WindowGeometry::new(length, window_size, stride);
            let mut contributors = vec![0u32; length];
            for i in 1..=geometry.total_windows {
                let span = geometry.span(i);
                let kept = geometry.kept(i, TrimPolicy::Midpoint);
                prop_assert!(kept.start >= span.start && kept.end <= span.end);
                for p in kept {
                    contributors[p] += 1;
                }
            }
            prop_assert!(contributors.iter().all(|&c| c == 1));
        }
    }
}
