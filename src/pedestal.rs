use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel::{Channel, Currents, Gain};
use crate::error::Error;
use crate::sample::QuadrantSample;
use crate::Result;

/// Baseline of one channel at one gain.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pedestal {
    pub value: f64,
    pub uncertainty: f64,
}

/// Externally supplied pedestal values for one gain, as found in configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PedestalPrior {
    pub gain: Gain,
    pub values: BTreeMap<Channel, f64>,
}

/// Per-gain, per-channel baselines.
///
/// A set is never edited: estimation, merging with priors and tracking all produce a new
/// set which replaces the old one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PedestalSet {
    entries: BTreeMap<(Gain, Channel), Pedestal>,
}

impl PedestalSet {
    pub fn from_entries(entries: impl IntoIterator<Item = ((Gain, Channel), Pedestal)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn from_priors(priors: &[PedestalPrior]) -> Self {
        Self::from_entries(priors.iter().flat_map(|prior| {
            prior.values.iter().map(|(&channel, &value)| {
                (
                    (prior.gain, channel),
                    Pedestal {
                        value,
                        uncertainty: 0.0,
                    },
                )
            })
        }))
    }

    pub fn get(&self, gain: Gain, channel: Channel) -> Option<Pedestal> {
        self.entries.get(&(gain, channel)).copied()
    }

    pub fn gains(&self) -> impl Iterator<Item = Gain> + '_ {
        self.entries.keys().map(|(gain, _)| *gain).dedup()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new set holding every entry of `self`, plus the entries of `prior` that `self`
    /// lacks.
    #[must_use]
    pub fn with_fallback(&self, prior: &Self) -> Self {
        let mut entries = prior.entries.clone();
        entries.extend(self.entries.iter().map(|(key, pedestal)| (*key, *pedestal)));
        Self { entries }
    }

    /// Pedestal-subtracted currents of `sample`.
    ///
    /// # Errors
    /// Returns [`Error::MissingPedestal`] if any channel has no pedestal at the sample gain.
    pub fn subtract(&self, sample: &QuadrantSample) -> Result<Currents> {
        let mut currents = sample.currents;
        for channel in Channel::ALL {
            let pedestal = self
                .get(sample.gain, channel)
                .ok_or(Error::MissingPedestal {
                    gain: sample.gain,
                    channel,
                })?;
            currents[channel] -= pedestal.value;
        }
        Ok(currents)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PedestalEstimator {
    /// Beam current at or below which the beam is considered off
    pub current_threshold: f64,
    /// Samples dropped at each end of a beam-off run while the current ramps
    pub trim: usize,
}

impl Default for PedestalEstimator {
    fn default() -> Self {
        Self {
            current_threshold: 0.3,
            trim: 2,
        }
    }
}

impl PedestalEstimator {
    /// The samples at `gain` used for the pedestal estimate.
    ///
    /// Samples at other gains are ignored; they do not interrupt a beam-off run.
    pub fn retained<'a>(
        &self,
        samples: &'a [QuadrantSample],
        gain: Gain,
    ) -> Vec<&'a QuadrantSample> {
        let runs = samples
            .iter()
            .filter(|sample| sample.gain == gain)
            .group_by(|sample| sample.beam_current <= self.current_threshold);

        let mut retained = vec![];
        for (beam_off, run) in &runs {
            if !beam_off {
                continue;
            }
            let run = run.collect::<Vec<_>>();
            if run.len() > 2 * self.trim {
                retained.extend_from_slice(&run[self.trim..run.len() - self.trim]);
            }
        }
        retained
    }

    /// Estimate the pedestals of every channel at `gain`.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] if no sample survives run trimming.
    pub fn estimate(&self, samples: &[QuadrantSample], gain: Gain) -> Result<PedestalSet> {
        let retained = self.retained(samples, gain);
        if retained.is_empty() {
            warn!(%gain, "no pedestal data found");
            return Err(Error::InsufficientData(format!(
                "no beam-off samples at gain {gain}"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let count = retained.len() as f64;
        let entries = Channel::ALL.map(|channel| {
            let mean = retained.iter().map(|s| s.currents[channel]).sum::<f64>() / count;
            let uncertainty = if retained.len() > 1 {
                (retained
                    .iter()
                    .map(|s| (s.currents[channel] - mean).powi(2))
                    .sum::<f64>()
                    / (count - 1.0))
                    .sqrt()
            } else {
                0.0
            };
            info!(%gain, %channel, mean, uncertainty, "pedestal");
            (
                (gain, channel),
                Pedestal {
                    value: mean,
                    uncertainty,
                },
            )
        });

        Ok(PedestalSet::from_entries(entries))
    }

    /// Estimate the pedestals for each of `gains`.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] for the first gain without beam-off samples.
    pub fn estimate_all(&self, samples: &[QuadrantSample], gains: &[Gain]) -> Result<PedestalSet> {
        let mut entries = BTreeMap::new();
        for &gain in gains {
            entries.extend(self.estimate(samples, gain)?.entries);
        }
        Ok(PedestalSet { entries })
    }
}

/// Follows pedestal drift during beam-off periods of a live stream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PedestalTracker {
    /// Weight of the newest beam-off reading
    pub fraction: f64,
}

impl Default for PedestalTracker {
    fn default() -> Self {
        Self { fraction: 0.5 }
    }
}

impl PedestalTracker {
    /// The pedestals after observing `sample`.
    ///
    /// Only samples taken with no beam move the pedestals.
    #[must_use]
    pub fn track(&self, pedestals: &PedestalSet, sample: &QuadrantSample) -> PedestalSet {
        if sample.beam_current != 0.0 {
            return pedestals.clone();
        }
        let updated = sample.currents.iter().map(|(channel, raw)| {
            let pedestal = pedestals.get(sample.gain, channel).map_or(
                Pedestal {
                    value: raw,
                    uncertainty: 0.0,
                },
                |old| Pedestal {
                    value: old.value.mul_add(1.0 - self.fraction, raw * self.fraction),
                    uncertainty: old.uncertainty,
                },
            );
            ((sample.gain, channel), pedestal)
        });
        let mut entries = pedestals.entries.clone();
        entries.extend(updated);
        PedestalSet { entries }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{Pedestal, PedestalEstimator, PedestalPrior, PedestalSet, PedestalTracker};
    use crate::channel::{Channel, Currents, Gain};
    use crate::error::Error;
    use crate::sample::QuadrantSample;

    fn sample(beam_current: f64, value: f64, gain: u8) -> QuadrantSample {
        QuadrantSample {
            timestamp: 0.0,
            gain: Gain(gain),
            currents: Currents::from_fn(|ii| value + ii as f64),
            beam_current,
            reference_x: 0.0,
            reference_y: 0.0,
        }
    }

    /// Beam-off runs of the given lengths separated by single beam-on samples.
    fn runs(lengths: &[usize]) -> Vec<QuadrantSample> {
        let mut samples = vec![];
        for &length in lengths {
            samples.push(sample(50.0, 1e6, 3));
            samples.extend((0..length).map(|_| sample(0.1, 10.0, 3)));
        }
        samples.push(sample(50.0, 1e6, 3));
        samples
    }

    proptest! {
        #[test]
        fn each_beam_off_run_contributes_all_but_its_edges(
            lengths in proptest::collection::vec(0..12usize, 1..6)
        ) {
            let estimator = PedestalEstimator::default();
            let samples = runs(&lengths);
            let expected: usize = lengths.iter().map(|n| n.saturating_sub(4)).sum();
            prop_assert_eq!(estimator.retained(&samples, Gain(3)).len(), expected);
        }
    }

    #[test]
    fn ramping_edges_do_not_bias_the_pedestal() {
        let mut samples = vec![sample(50.0, 1e6, 3)];
        // Ramp down, flat, ramp up
        samples.push(sample(0.2, 500.0, 3));
        samples.push(sample(0.2, 200.0, 3));
        samples.extend((0..6).map(|_| sample(0.0, 10.0, 3)));
        samples.push(sample(0.2, 200.0, 3));
        samples.push(sample(0.2, 500.0, 3));
        samples.push(sample(50.0, 1e6, 3));

        let pedestals = PedestalEstimator::default()
            .estimate(&samples, Gain(3))
            .unwrap();
        for (ii, channel) in Channel::ALL.into_iter().enumerate() {
            let pedestal = pedestals.get(Gain(3), channel).unwrap();
            approx::assert_relative_eq!(pedestal.value, 10.0 + ii as f64);
            approx::assert_relative_eq!(pedestal.uncertainty, 0.0);
        }
    }

    #[test]
    fn uncertainty_is_the_sample_standard_deviation() {
        let mut samples = runs(&[0]);
        let values = [10.0, 10.0, 12.0, 14.0, 16.0, 10.0, 10.0];
        samples.extend(values.iter().map(|&v| sample(0.0, v, 3)));

        let pedestal = PedestalEstimator::default()
            .estimate(&samples, Gain(3))
            .unwrap()
            .get(Gain(3), Channel::ALL[0])
            .unwrap();
        approx::assert_relative_eq!(pedestal.value, 14.0);
        approx::assert_relative_eq!(pedestal.uncertainty, 2.0);
    }

    #[test]
    fn other_gains_are_ignored() {
        let mut samples = runs(&[8]);
        samples.extend((0..8).map(|_| sample(0.0, 999.0, 4)));
        let pedestals = PedestalEstimator::default()
            .estimate(&samples, Gain(3))
            .unwrap();
        approx::assert_relative_eq!(pedestals.get(Gain(3), Channel::ALL[0]).unwrap().value, 10.0);
        assert!(pedestals.get(Gain(4), Channel::ALL[0]).is_none());
    }

    #[test]
    fn short_runs_give_insufficient_data() {
        let samples = runs(&[4, 3, 1]);
        let result = PedestalEstimator::default().estimate(&samples, Gain(3));
        assert!(matches!(result, Err(Error::InsufficientData(_))));

        let result = PedestalEstimator::default().estimate_all(&runs(&[10]), &[Gain(3), Gain(5)]);
        assert!(matches!(result, Err(Error::InsufficientData(_))));
    }

    #[test]
    fn subtraction_requires_every_channel() {
        let pedestals = PedestalEstimator::default()
            .estimate(&runs(&[10]), Gain(3))
            .unwrap();
        let raw = sample(40.0, 110.0, 3);
        let subtracted = pedestals.subtract(&raw).unwrap();
        for (_, value) in subtracted.iter() {
            approx::assert_relative_eq!(value, 100.0);
        }

        let result = pedestals.subtract(&sample(40.0, 110.0, 4));
        assert!(matches!(result, Err(Error::MissingPedestal { .. })));
    }

    #[test]
    fn fallback_fills_only_missing_entries() {
        let estimated = PedestalEstimator::default()
            .estimate(&runs(&[10]), Gain(3))
            .unwrap();
        let prior = PedestalSet::from_priors(&[
            PedestalPrior {
                gain: Gain(3),
                values: Channel::ALL.into_iter().map(|c| (c, -45.0)).collect(),
            },
            PedestalPrior {
                gain: Gain(4),
                values: BTreeMap::from([(Channel::ALL[0], 1380.0)]),
            },
        ]);

        let merged = estimated.with_fallback(&prior);
        approx::assert_relative_eq!(merged.get(Gain(3), Channel::ALL[0]).unwrap().value, 10.0);
        approx::assert_relative_eq!(merged.get(Gain(4), Channel::ALL[0]).unwrap().value, 1380.0);
        assert_eq!(merged.len(), 9);
        assert_eq!(merged.gains().collect::<Vec<_>>(), vec![Gain(3), Gain(4)]);
        // The inputs are untouched
        assert_eq!(estimated.len(), 8);
    }

    #[test]
    fn tracker_moves_pedestals_only_without_beam() {
        let pedestals = PedestalSet::from_entries(Channel::ALL.map(|c| {
            (
                (Gain(3), c),
                Pedestal {
                    value: 100.0,
                    uncertainty: 1.0,
                },
            )
        }));
        let tracker = PedestalTracker::default();

        let unchanged = tracker.track(&pedestals, &sample(20.0, 0.0, 3));
        assert_eq!(unchanged, pedestals);

        let mut quiet = sample(0.0, 0.0, 3);
        quiet.currents = Currents::new([50.0; 8]);
        let tracked = tracker.track(&pedestals, &quiet);
        approx::assert_relative_eq!(tracked.get(Gain(3), Channel::ALL[5]).unwrap().value, 75.0);
        approx::assert_relative_eq!(pedestals.get(Gain(3), Channel::ALL[5]).unwrap().value, 100.0);
    }
}
