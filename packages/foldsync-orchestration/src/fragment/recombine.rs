use std::collections::BTreeMap;

use foldsync_storage::{AccessionKey, PairRow, ReconciledRecord, ResidueRow};
use serde::{Deserialize, Serialize};

use super::aggregate::{smooth, Accumulator, Aggregate, Aggregation, Observation, RESIDUE_ORDER, SEC_ORDER};
use super::{TrimPolicy, WindowGeometry};
use crate::config::{SyncConfig, Thresholds};
use crate::error::{OrchestratorError, Result};

/// Per-residue output of the annotation tool for one window (site is window-local, 1-based)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidueObservation {
    pub site: u32,
    pub aa: char,
    pub plddt: f64,
    pub asa: f64,
    pub rel_asa: f64,
    pub sec: char,
    #[serde(default)]
    pub phi: Option<f64>,
    #[serde(default)]
    pub psi: Option<f64>,
    #[serde(default)]
    pub omega: Option<f64>,
    #[serde(default)]
    pub tau: Option<f64>,
    #[serde(default)]
    pub chi: [Option<f64>; 5],
}

/// Pairwise measurement between two window-local sites (1-based)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairObservation {
    pub site1: u32,
    pub site2: u32,
    pub metric_type: String,
    pub value: f64,
}

/// Everything the annotation stage produced for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub accession: String,
    pub fragment: u32,
    #[serde(default)]
    pub residues: Vec<ResidueObservation>,
    #[serde(default)]
    pub pairs: Vec<PairObservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Channel {
    Residue,
    Plddt,
    Asa,
    RelAsa,
    Sec,
    Phi,
    Psi,
    Omega,
    Tau,
    Chi1,
    Chi2,
    Chi3,
    Chi4,
    Chi5,
}

const CHANNELS: [Channel; 14] = [
    Channel::Residue,
    Channel::Plddt,
    Channel::Asa,
    Channel::RelAsa,
    Channel::Sec,
    Channel::Phi,
    Channel::Psi,
    Channel::Omega,
    Channel::Tau,
    Channel::Chi1,
    Channel::Chi2,
    Channel::Chi3,
    Channel::Chi4,
    Channel::Chi5,
];

impl Channel {
    fn aggregation(self) -> Aggregation {
        match self {
            Channel::Residue => Aggregation::CategoricalWithConfidence {
                order: RESIDUE_ORDER,
            },
            Channel::Sec => Aggregation::CategoricalWithConfidence { order: SEC_ORDER },
            Channel::Plddt | Channel::Asa | Channel::RelAsa => Aggregation::ScalarMean,
            _ => Aggregation::Angular,
        }
    }

    fn observe(self, obs: &ResidueObservation) -> Option<Observation> {
        let label = |label| Observation::Label {
            label,
            confidence: obs.plddt,
        };
        match self {
            Channel::Residue => Some(label(obs.aa)),
            Channel::Sec => Some(label(obs.sec)),
            Channel::Plddt => Some(Observation::Scalar(obs.plddt)),
            Channel::Asa => Some(Observation::Scalar(obs.asa)),
            Channel::RelAsa => Some(Observation::Scalar(obs.rel_asa)),
            Channel::Phi => obs.phi.map(Observation::Angle),
            Channel::Psi => obs.psi.map(Observation::Angle),
            Channel::Omega => obs.omega.map(Observation::Angle),
            Channel::Tau => obs.tau.map(Observation::Angle),
            Channel::Chi1 => obs.chi[0].map(Observation::Angle),
            Channel::Chi2 => obs.chi[1].map(Observation::Angle),
            Channel::Chi3 => obs.chi[2].map(Observation::Angle),
            Channel::Chi4 => obs.chi[3].map(Observation::Angle),
            Channel::Chi5 => obs.chi[4].map(Observation::Angle),
        }
    }
}

struct PositionAccumulator {
    slots: [Accumulator; 14],
    contributors: u32,
}

impl PositionAccumulator {
    fn new() -> Self {
        Self {
            slots: CHANNELS.map(|c| Accumulator::new(c.aggregation())),
            contributors: 0,
        }
    }

    fn push(&mut self, obs: &ResidueObservation) {
        for (slot, channel) in self.slots.iter_mut().zip(CHANNELS) {
            if let Some(o) = channel.observe(obs) {
                slot.push(o);
            }
        }
        self.contributors += 1;
    }

    fn finish(&self) -> [Aggregate; 14] {
        let mut out = [Aggregate::Scalar(None); 14];
        for (i, slot) in self.slots.iter().enumerate() {
            out[i] = slot.finish();
        }
        out
    }
}

/// Stitches window results into a full-length record
#[derive(Debug, Clone, PartialEq)]
pub struct Recombiner {
    pub window_size: usize,
    pub stride: usize,
    pub trim: TrimPolicy,
    pub smoothing_half_window: usize,
    pub thresholds: Thresholds,
}

impl Recombiner {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            window_size: config.fragment.window_size,
            stride: config.fragment.stride,
            trim: config.fragment.trim_policy(),
            smoothing_half_window: config.fragment.smoothing_half_window,
            thresholds: config.thresholds.clone(),
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Combine `results` (one per fragment 1..=`total_windows`) into a
    /// full-length record. Zero contributors for any position is an error.
    pub fn recombine(
        &self,
        key: &AccessionKey,
        results: &[WindowResult],
        total_windows: usize,
    ) -> Result<ReconciledRecord> {
        let by_fragment = index_by_fragment(key, results, total_windows)?;
        let geometry = self.geometry(key, &by_fragment)?;
        let length = geometry.length;

        let mut positions: Vec<PositionAccumulator> =
            (0..length).map(|_| PositionAccumulator::new()).collect();
        let mut pair_sums: BTreeMap<(usize, usize, String), (f64, usize)> = BTreeMap::new();

        for (i, result) in by_fragment.iter().enumerate() {
            let index = i + 1;
            let span = geometry.span(index);
            let kept = geometry.kept(index, self.trim);

            for global in kept.clone() {
                positions[global].push(&result.residues[global - span.start]);
            }

            for pair in &result.pairs {
                if pair.site1 == 0 || pair.site2 == 0 {
                    continue;
                }
                let g1 = span.start + pair.site1 as usize - 1;
                let g2 = span.start + pair.site2 as usize - 1;
                if g1 == g2 || !kept.contains(&g1) || !kept.contains(&g2) {
                    continue;
                }
                let (lo, hi) = if g1 < g2 { (g1, g2) } else { (g2, g1) };
                let entry = pair_sums
                    .entry((lo, hi, pair.metric_type.clone()))
                    .or_insert((0.0, 0));
                entry.0 += pair.value;
                entry.1 += 1;
            }
        }

        if let Some(position) = positions.iter().position(|p| p.contributors == 0) {
            return Err(OrchestratorError::CoverageGap {
                key: key.to_string(),
                position,
            });
        }

        let aggregates: Vec<[Aggregate; 14]> = positions.iter().map(|p| p.finish()).collect();
        let scalar = |a: &[Aggregate; 14], c: Channel| a[c as usize].scalar().unwrap_or(f64::NAN);
        let angle = |a: &[Aggregate; 14], c: Channel| a[c as usize].angle();

        let plddt: Vec<f64> = aggregates.iter().map(|a| scalar(a, Channel::Plddt)).collect();
        let asa: Vec<f64> = aggregates.iter().map(|a| scalar(a, Channel::Asa)).collect();
        let rel_asa: Vec<f64> = aggregates.iter().map(|a| scalar(a, Channel::RelAsa)).collect();
        let plddt10 = smooth(&plddt, self.smoothing_half_window);
        let asa10 = smooth(&asa, self.smoothing_half_window);
        let rel_asa10 = smooth(&rel_asa, self.smoothing_half_window);

        let t = &self.thresholds;
        let residues: Vec<ResidueRow> = aggregates
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let omega = angle(a, Channel::Omega);
                ResidueRow {
                    site: i as u32 + 1,
                    aa: a[Channel::Residue as usize].label().unwrap_or('X'),
                    plddt: plddt[i],
                    plddt10: plddt10[i],
                    asa: asa[i],
                    asa10: asa10[i],
                    rel_asa: rel_asa[i],
                    rel_asa10: rel_asa10[i],
                    dis: disorder_class(rel_asa[i], t.disorder),
                    dis10: disorder_class(rel_asa10[i], t.disorder),
                    surf: surface_class(rel_asa[i], t.buried),
                    surf10: surface_class(rel_asa10[i], t.buried),
                    sec: a[Channel::Sec as usize].label().unwrap_or(' '),
                    iso: omega.map(|w| isomer_class(w, t)),
                    phi: angle(a, Channel::Phi),
                    psi: angle(a, Channel::Psi),
                    omega,
                    tau: angle(a, Channel::Tau),
                    chi: [
                        angle(a, Channel::Chi1),
                        angle(a, Channel::Chi2),
                        angle(a, Channel::Chi3),
                        angle(a, Channel::Chi4),
                        angle(a, Channel::Chi5),
                    ],
                }
            })
            .collect();

        let pairs = pair_sums
            .into_iter()
            .map(|((lo, hi, metric_type), (sum, n))| PairRow {
                site1: lo as u32 + 1,
                site2: hi as u32 + 1,
                metric_type,
                value: sum / n as f64,
            })
            .collect();

        let sequence = residues.iter().map(|r| r.aa).collect();
        Ok(ReconciledRecord {
            key: key.clone(),
            sequence,
            residues,
            pairs,
        })
    }

    /// The residue channel must equal the canonical sequence exactly
    pub fn verify(record: &ReconciledRecord, canonical: &str) -> Result<()> {
        let observed = record.residue_string();
        if observed != canonical {
            return Err(OrchestratorError::SequenceMismatch {
                key: record.key.to_string(),
                expected: canonical.to_string(),
                observed,
            });
        }
        Ok(())
    }

    fn geometry(&self, key: &AccessionKey, by_fragment: &[&WindowResult]) -> Result<WindowGeometry> {
        let total = by_fragment.len();
        let last_len = by_fragment[total - 1].residues.len();
        let length = if total == 1 {
            last_len
        } else {
            (total - 1) * self.stride + last_len
        };
        let geometry = WindowGeometry::new(length, self.window_size, self.stride);

        if geometry.total_windows != total {
            return Err(OrchestratorError::WindowShape {
                key: key.to_string(),
                fragment: total as u32,
                expected: self.window_size.min(length),
                found: last_len,
            });
        }

        for (i, result) in by_fragment.iter().enumerate() {
            let expected = geometry.span(i + 1).len();
            let contiguous = result
                .residues
                .iter()
                .enumerate()
                .all(|(j, r)| r.site as usize == j + 1);
            if result.residues.len() != expected || !contiguous {
                return Err(OrchestratorError::WindowShape {
                    key: key.to_string(),
                    fragment: result.fragment,
                    expected,
                    found: result.residues.len(),
                });
            }
        }
        Ok(geometry)
    }
}

fn index_by_fragment<'a>(
    key: &AccessionKey,
    results: &'a [WindowResult],
    total_windows: usize,
) -> Result<Vec<&'a WindowResult>> {
    let mut sorted: Vec<&WindowResult> = results.iter().collect();
    sorted.sort_by_key(|r| r.fragment);

    let discovered: Vec<u32> = sorted.iter().map(|r| r.fragment).collect();
    let expected: Vec<u32> = (1..=total_windows as u32).collect();
    if total_windows == 0 || discovered != expected {
        return Err(OrchestratorError::FragmentCountMismatch {
            key: key.to_string(),
            expected: total_windows,
            discovered,
        });
    }
    Ok(sorted)
}

fn disorder_class(rel_asa: f64, threshold: f64) -> char {
    if rel_asa >= threshold {
        '*'
    } else {
        '.'
    }
}

fn surface_class(rel_asa: f64, buried: f64) -> char {
    if rel_asa <= buried {
        'C'
    } else {
        'S'
    }
}

fn isomer_class(omega: f64, t: &Thresholds) -> char {
    if omega.abs() <= t.omega_cis_max {
        'c'
    } else if omega.abs() >= t.omega_trans_min {
        't'
    } else {
        ' '
    }
}
