//! Per-position aggregation of overlapping window observations

use std::collections::BTreeMap;

/// Mean resultant length below which a circular mean is undefined
const MIN_RESULTANT: f64 = 1e-9;

/// Results this close to -180 degrees are reported as +180
const WRAP_TOLERANCE: f64 = 1e-9;

/// Secondary-structure labels in tie-break order (DSSP; `' '` is loop)
pub const SEC_ORDER: &str = "HGIEBTSP ";

/// Residue letters in tie-break order
pub const RESIDUE_ORDER: &str = "ACDEFGHIKLMNPQRSTVWXY";

/// How observations of one channel are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Periodic degrees in (-180, 180]
    Angular,
    /// Label vote, confidence breaks count ties, then a fixed order
    CategoricalWithConfidence { order: &'static str },
    /// Arithmetic mean
    ScalarMean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Angle(f64),
    Label { label: char, confidence: f64 },
    Scalar(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Angle(Option<f64>),
    Label(Option<char>),
    Scalar(Option<f64>),
}

impl Aggregate {
    pub fn angle(self) -> Option<f64> {
        match self {
            Aggregate::Angle(v) => v,
            _ => None,
        }
    }

    pub fn label(self) -> Option<char> {
        match self {
            Aggregate::Label(v) => v,
            _ => None,
        }
    }

    pub fn scalar(self) -> Option<f64> {
        match self {
            Aggregate::Scalar(v) => v,
            _ => None,
        }
    }
}

/// Running state for one channel at one position
#[derive(Debug, Clone)]
pub enum Accumulator {
    Angular { sum_sin: f64, sum_cos: f64, n: usize },
    Categorical { votes: Vec<(char, f64)>, order: &'static str },
    Scalar { sum: f64, n: usize },
}

impl Accumulator {
    pub fn new(aggregation: Aggregation) -> Self {
        match aggregation {
            Aggregation::Angular => Accumulator::Angular {
                sum_sin: 0.0,
                sum_cos: 0.0,
                n: 0,
            },
            Aggregation::CategoricalWithConfidence { order } => Accumulator::Categorical {
                votes: Vec::new(),
                order,
            },
            Aggregation::ScalarMean => Accumulator::Scalar { sum: 0.0, n: 0 },
        }
    }

    /// Add one observation. Observations of the wrong kind are ignored.
    pub fn push(&mut self, observation: Observation) {
        match (self, observation) {
            (Accumulator::Angular { sum_sin, sum_cos, n }, Observation::Angle(deg)) => {
                let rad = deg.to_radians();
                *sum_sin += rad.sin();
                *sum_cos += rad.cos();
                *n += 1;
            }
            (
                Accumulator::Categorical { votes, .. },
                Observation::Label { label, confidence },
            ) => votes.push((label, confidence)),
            (Accumulator::Scalar { sum, n }, Observation::Scalar(v)) => {
                *sum += v;
                *n += 1;
            }
            (acc, obs) => {
                tracing::debug!(?obs, accumulator = ?acc, "observation kind does not match channel");
            }
        }
    }

    pub fn finish(&self) -> Aggregate {
        match self {
            Accumulator::Angular { sum_sin, sum_cos, n } => {
                Aggregate::Angle(resultant_angle(*sum_sin, *sum_cos, *n))
            }
            Accumulator::Categorical { votes, order } => {
                Aggregate::Label(majority_vote(votes, order))
            }
            Accumulator::Scalar { sum, n } => {
                Aggregate::Scalar((*n > 0).then(|| sum / *n as f64))
            }
        }
    }
}

fn resultant_angle(sum_sin: f64, sum_cos: f64, n: usize) -> Option<f64> {
    if n == 0 {
        return None;
    }
    if sum_sin.hypot(sum_cos) / (n as f64) < MIN_RESULTANT {
        return None;
    }
    let deg = sum_sin.atan2(sum_cos).to_degrees();
    if deg <= -180.0 + WRAP_TOLERANCE {
        Some((deg + 360.0).min(180.0))
    } else {
        Some(deg.min(180.0))
    }
}

/// Circular mean of angles in degrees, result in (-180, 180].
///
/// Returns `None` for an empty input or when the observations cancel out.
pub fn circular_mean(angles: &[f64]) -> Option<f64> {
    let mut acc = Accumulator::new(Aggregation::Angular);
    for &a in angles {
        acc.push(Observation::Angle(a));
    }
    acc.finish().angle()
}

/// Majority vote over `(label, confidence)` observations.
///
/// Count ties go to the label holding the single highest confidence among
/// the tied labels; remaining ties follow `order` (labels missing from it
/// sort after, by code point).
pub fn majority_vote(votes: &[(char, f64)], order: &str) -> Option<char> {
    let mut tally: BTreeMap<char, (usize, f64)> = BTreeMap::new();
    for &(label, confidence) in votes {
        let entry = tally.entry(label).or_insert((0, f64::NEG_INFINITY));
        entry.0 += 1;
        entry.1 = entry.1.max(confidence);
    }

    let max_count = tally.values().map(|(count, _)| *count).max()?;
    let tied: Vec<(char, f64)> = tally
        .iter()
        .filter(|(_, (count, _))| *count == max_count)
        .map(|(label, (_, best))| (*label, *best))
        .collect();

    let best_confidence = tied
        .iter()
        .map(|(_, best)| *best)
        .fold(f64::NEG_INFINITY, f64::max);

    let rank = |label: char| order.find(label).unwrap_or(order.len() + label as usize);

    tied.into_iter()
        .filter(|(_, best)| *best == best_confidence)
        .map(|(label, _)| label)
        .min_by_key(|label| rank(*label))
}

/// Centered moving average with half-window `half`; the window shrinks at
/// the sequence edges.
pub fn smooth(values: &[f64], half: usize) -> Vec<f64> {
    let n = values.len();
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for v in values {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v);
    }

    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            (prefix[hi] - prefix[lo]) / (hi - lo) as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_circular_mean_symmetric_pair() {
        assert!(approx(circular_mean(&[10.0, -10.0]).unwrap(), 0.0));
    }

    #[test]
    fn test_circular_mean_wraps_at_180() {
        let mean = circular_mean(&[179.0, -179.0]).unwrap();
        assert!(approx(mean, 180.0), "got {}", mean);
    }

    #[test]
    fn test_circular_mean_minus_180_maps_to_180() {
        assert!(approx(circular_mean(&[-180.0]).unwrap(), 180.0));
    }

    #[test]
    fn test_circular_mean_cancelling_is_undefined() {
        assert_eq!(circular_mean(&[90.0, -90.0]), None);
        assert_eq!(circular_mean(&[]), None);
    }

    #[test]
    fn test_circular_mean_single_value() {
        assert!(approx(circular_mean(&[-63.5]).unwrap(), -63.5));
    }

    #[test]
    fn test_vote_confidence_breaks_count_tie() {
        let votes = [('H', 0.9), ('H', 0.5), ('G', 0.95), ('G', 0.4)];
        assert_eq!(majority_vote(&votes, SEC_ORDER), Some('G'));
    }

    #[test]
    fn test_vote_count_wins_over_confidence() {
        let votes = [('E', 0.2), ('E', 0.3), ('H', 0.99)];
        assert_eq!(majority_vote(&votes, SEC_ORDER), Some('E'));
    }

    #[test]
    fn test_vote_full_tie_uses_canonical_order() {
        let votes = [('T', 0.7), ('E', 0.7)];
        assert_eq!(majority_vote(&votes, SEC_ORDER), Some('E'));
        let votes = [(' ', 0.7), ('S', 0.7)];
        assert_eq!(majority_vote(&votes, SEC_ORDER), Some('S'));
    }

    #[test]
    fn test_vote_unknown_labels_sort_last() {
        let votes = [('Z', 0.5), ('H', 0.5)];
        assert_eq!(majority_vote(&votes, SEC_ORDER), Some('H'));
    }

    #[test]
    fn test_vote_empty() {
        assert_eq!(majority_vote(&[], SEC_ORDER), None);
    }

    #[test]
    fn test_scalar_mean() {
        let mut acc = Accumulator::new(Aggregation::ScalarMean);
        acc.push(Observation::Scalar(1.0));
        acc.push(Observation::Scalar(4.0));
        acc.push(Observation::Angle(90.0));
        assert_eq!(acc.finish().scalar(), Some(2.5));
    }

    #[test]
    fn test_smooth_shrinks_at_edges() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        let s = smooth(&values, 1);
        assert!(approx(s[0], 0.5));
        assert!(approx(s[2], 2.0));
        assert!(approx(s[4], 3.5));
    }

    #[test]
    fn test_smooth_constant_series_unchanged() {
        let values = vec![0.7; 50];
        assert!(smooth(&values, 10).iter().all(|v| approx(*v, 0.7)));
    }
}
