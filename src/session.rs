//! The calibration workflow bound to one configuration and one sample source.

use tracing::{info, warn};

use crate::calibration::{CalibrationFit, CalibrationFitter, Parameterization};
use crate::channel::{Axis, Channel, Gain, SensorAxis};
use crate::config::{Config, ScanConfig};
use crate::error::Error;
use crate::fitting::{FitOutcome, LeastSquares};
use crate::histogram::{ResponseMap, ResponseProfile};
use crate::linearity::LinearityRun;
use crate::pedestal::PedestalSet;
use crate::sample::{QuadrantSample, TimeWindow};
use crate::source::SampleSource;
use crate::spectrum::{Spectrum, SpectrumAccumulator};
use crate::store::CalibrationStore;
use crate::transit::{Transit, TransitDetector};
use crate::Result;

/// Owns everything a calibration run reads and produces.
///
/// Pedestals and calibrations are swapped wholesale by the operations that produce them;
/// nothing else mutates them.
pub struct Session<S> {
    config: Config,
    source: S,
    pedestals: PedestalSet,
    store: CalibrationStore,
    fitter: CalibrationFitter<LeastSquares>,
}

impl<S: SampleSource> Session<S> {
    /// A session starting from the configured pedestal priors and an empty store.
    pub fn new(config: Config, source: S) -> Self {
        let pedestals = PedestalSet::from_priors(&config.pedestal_priors);
        let fitter = CalibrationFitter::new(config.fit).with_tolerance(config.degenerate_tolerance);
        Self {
            config,
            source,
            pedestals,
            store: CalibrationStore::new(),
            fitter,
        }
    }

    /// Start from previously saved calibrations.
    #[must_use]
    pub fn with_store(mut self, store: CalibrationStore) -> Self {
        self.store = store;
        self
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn pedestals(&self) -> &PedestalSet {
        &self.pedestals
    }

    pub const fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Re-estimate the pedestals of every configured gain from beam-off data in `window`.
    ///
    /// Channels the priors cover but the estimate does not keep their prior.
    ///
    /// # Errors
    /// Returns an error if the source fails or a gain has no beam-off data.
    pub fn estimate_pedestals(&mut self, window: &TimeWindow) -> Result<&PedestalSet> {
        let samples = self.source.samples(window, None)?;
        let estimated = self
            .config
            .estimator
            .estimate_all(&samples, &self.config.gains)?;
        self.pedestals = estimated.with_fallback(&PedestalSet::from_priors(&self.config.pedestal_priors));
        info!("estimated {} pedestals", self.pedestals.len());
        Ok(&self.pedestals)
    }

    /// Follow pedestal drift with a live sample.
    pub fn track_pedestals(&mut self, sample: &QuadrantSample) {
        self.pedestals = self.config.tracker.track(&self.pedestals, sample);
    }

    fn scan_samples(&self, scan: &ScanConfig) -> Result<Vec<QuadrantSample>> {
        let samples = self.source.samples(&scan.window, Some(scan.gain))?;
        if samples.is_empty() {
            warn!(scan = %scan.name, "scan selects no samples");
        }
        Ok(samples)
    }

    /// # Errors
    /// Returns an error for an unknown scan, a failing source or a missing pedestal.
    pub fn build_map(&self, scan: &str, channel: Channel) -> Result<ResponseMap> {
        let scan = self.config.scan(scan)?;
        let samples = self.scan_samples(scan)?;
        scan.profile_builder()
            .build_map(&samples, &self.pedestals, channel)
    }

    /// # Errors
    /// Returns an error for an unknown scan, a failing source or a missing pedestal.
    pub fn build_profile(&self, scan: &str, channel: Channel, axis: Axis) -> Result<ResponseProfile> {
        let scan = self.config.scan(scan)?;
        let samples = self.scan_samples(scan)?;
        scan.profile_builder().build_profile(
            &samples,
            &self.pedestals,
            channel,
            axis,
            scan.average_range(),
        )
    }

    /// Calibrate `axis` from `scan` and install both parameterizations for the scan gain.
    ///
    /// # Errors
    /// Returns an error if the profiles cannot be built or fitted, or the axis has no scale
    /// constant.
    pub fn calibrate(&mut self, scan: &str, axis: SensorAxis) -> Result<CalibrationFit> {
        let scan_config = self.config.scan(scan)?;
        let reference = match axis.axis {
            Axis::X => scan_config.reference_x,
            Axis::Y => scan_config.reference_y,
        };
        let gain = scan_config.gain;
        let scale = self.config.scale(axis)?;

        let plus = self.build_profile(scan, axis.plus(), axis.axis)?;
        let minus = self.build_profile(scan, axis.minus(), axis.axis)?;
        let fit = self.fitter.fit(&plus, &minus, reference, scale)?;

        for parameterization in [Parameterization::Rational, Parameterization::Quadratic] {
            if self
                .store
                .replace(gain, axis, fit.coefficients(parameterization))
                .is_some()
            {
                info!(%gain, %axis, ?parameterization, "replaced calibration");
            }
        }
        Ok(fit)
    }

    /// Absolute position along `axis` for a raw sample.
    ///
    /// # Errors
    /// [`crate::Error::NoSolution`] and [`crate::Error::InsufficientSignal`] when the sample
    /// has no estimate; missing pedestals or calibrations otherwise.
    pub fn locate(
        &self,
        sample: &QuadrantSample,
        axis: SensorAxis,
        parameterization: Parameterization,
    ) -> Result<f64> {
        let currents = self.pedestals.subtract(sample)?;
        let coefficients = self.store.require(sample.gain, axis, parameterization)?;
        self.config
            .solver
            .position(coefficients, currents[axis.plus()], currents[axis.minus()])
    }

    /// Beam trips and recoveries seen by `channel` at `gain` inside `window`, each with the
    /// eight-channel readings leading up to it.
    ///
    /// # Errors
    /// Returns an error if the source fails.
    pub fn detect_transits(&self, window: &TimeWindow, gain: Gain, channel: Channel) -> Result<Vec<Transit>> {
        let samples = self.source.samples(window, Some(gain))?;
        Ok(TransitDetector::new(self.config.transit, channel)
            .detect(samples.iter().map(|sample| (sample.timestamp, sample.currents))))
    }

    /// Magnitude spectra of every channel at `gain` inside `window`.
    ///
    /// Consecutive samples are cut into records of the configured length; a trailing
    /// partial record is dropped.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] if the window holds less than one record, or any
    /// source error.
    pub fn spectrum(&self, window: &TimeWindow, gain: Gain) -> Result<Spectrum> {
        let samples = self.source.samples(window, Some(gain))?;
        let record_len = self.config.spectrum.record_len;
        if samples.len() < record_len {
            return Err(Error::InsufficientData(format!(
                "{} samples do not fill a record of {record_len}",
                samples.len()
            )));
        }
        let mut accumulator = SpectrumAccumulator::new(self.config.spectrum)?;
        for record in samples.chunks_exact(record_len) {
            let readings = record.iter().map(|sample| sample.currents).collect::<Vec<_>>();
            accumulator.push_record(record[0].timestamp, &readings)?;
        }
        Ok(accumulator.finish())
    }

    /// Linearity fit of `channel` over `runs`.
    ///
    /// Every run is profiled separately at each configured gain before the profiles are
    /// merged, so readings at different gains only meet once converted to nA.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] without a linearity section, otherwise any source,
    /// pedestal or fit error.
    pub fn linearity(&self, channel: Channel, runs: &[LinearityRun]) -> Result<FitOutcome> {
        let linearity = self
            .config
            .linearity
            .ok_or_else(|| Error::InvalidConfig("no linearity section configured".into()))?;
        let mut profiles = vec![];
        for run in runs {
            for &gain in &self.config.gains {
                let samples = self.source.samples(&run.window, Some(gain))?;
                if samples.is_empty() {
                    continue;
                }
                profiles.push(linearity.intensity_profile(
                    &samples,
                    &self.pedestals,
                    channel,
                    run.intensity_scale,
                )?);
            }
        }
        linearity.calibrate(&profiles, &self.config.fit)
    }
}
