//! Binned detector response over the positioner grid.
//!
//! A scan moves the collimator over a fixed grid of positioner settings. Samples are
//! binned into a [`ResponseMap`] over (x, y); projecting the map gives a
//! [`ResponseProfile`] along one axis, which is what the calibration fits.

use std::ops::Range;

use ndarray::{Array1, Array2, Axis as ArrayAxis};
use serde::{Deserialize, Serialize};

use crate::channel::{Axis, Channel};
use crate::error::Error;
use crate::pedestal::PedestalSet;
use crate::sample::QuadrantSample;
use crate::Result;

/// Fixed linear binning `bins` equal bins over `[low, high)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinGrid {
    pub bins: usize,
    pub low: f64,
    pub high: f64,
}

impl BinGrid {
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty or inverted grid.
    pub fn new(bins: usize, low: f64, high: f64) -> Result<Self> {
        let grid = Self { bins, low, high };
        grid.validate()?;
        Ok(grid)
    }

    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty or inverted grid.
    pub fn validate(&self) -> Result<()> {
        if self.bins == 0 || !(self.low.is_finite() && self.high.is_finite()) || self.high <= self.low {
            return Err(Error::InvalidConfig(format!(
                "bin grid needs at least one bin over a finite range, got {self:?}"
            )));
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn width(&self) -> f64 {
        (self.high - self.low) / self.bins as f64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn center(&self, bin: usize) -> f64 {
        self.width().mul_add(bin as f64 + 0.5, self.low)
    }

    pub fn centers(&self) -> Array1<f64> {
        (0..self.bins).map(|bin| self.center(bin)).collect()
    }

    /// The bin containing `x`, `None` outside the grid.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(self.low..self.high).contains(&x) {
            return None;
        }
        let bin = ((x - self.low) / self.width()).floor() as usize;
        Some(bin.min(self.bins - 1))
    }

    /// The bin containing `x`, or the edge bin nearest to it when `x` is off the grid.
    pub fn nearest_bin(&self, x: f64) -> usize {
        self.find_bin(x)
            .unwrap_or(if x < self.low { 0 } else { self.bins - 1 })
    }

    /// The same binning with coordinates measured from `origin`.
    #[must_use]
    pub fn shifted(&self, origin: f64) -> Self {
        Self {
            bins: self.bins,
            low: self.low - origin,
            high: self.high - origin,
        }
    }
}

/// How a binned object relates to the positioner axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    TwoDimensional,
    XProjected,
    YProjected,
}

/// A known-bad positioner setting, excluded from maps and profiles.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadPosition {
    pub x: f64,
    pub y: f64,
}

/// Smallest resolvable change of a binned reading: one ADC count averaged over a
/// 8192-sample readout frame.
pub const DEFAULT_RESOLUTION: f64 = 1.0 / 8192.0;

/// Running sums for one bin.
#[derive(Clone, Copy, Debug, Default)]
struct Accumulator {
    sum: f64,
    sum2: f64,
    count: u32,
}

impl Accumulator {
    fn fill(&mut self, value: f64) {
        self.sum += value;
        self.sum2 += value * value;
        self.count += 1;
    }

    /// Mean and its standard error.
    ///
    /// The spread of the readings is added in quadrature with `resolution`, so a bin of
    /// identical readings is as uncertain as one whose readings differ by a count.
    fn finish(self, resolution: f64) -> (f64, f64, u32) {
        if self.count == 0 {
            return (0.0, 0.0, 0);
        }
        let n = f64::from(self.count);
        let mean = self.sum / n;
        let variance = (self.sum2 / n - mean * mean).max(0.0);
        let error = (variance + resolution * resolution).sqrt() / n.sqrt();
        (mean, error, self.count)
    }
}

/// Mean response per (x, y) positioner cell.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseMap {
    x: BinGrid,
    y: BinGrid,
    content: Array2<f64>,
    error: Array2<f64>,
    count: Array2<u32>,
    suppressed: Array2<bool>,
}

impl ResponseMap {
    /// Bin `(x, y, value)` points; points off the grid are dropped.
    ///
    /// `resolution` is the smallest resolvable change of a reading; see
    /// [`DEFAULT_RESOLUTION`].
    pub fn from_points(
        x: BinGrid,
        y: BinGrid,
        resolution: f64,
        points: impl IntoIterator<Item = (f64, f64, f64)>,
    ) -> Self {
        let mut cells = Array2::from_elem((x.bins, y.bins), Accumulator::default());
        for (px, py, value) in points {
            if let (Some(i), Some(j)) = (x.find_bin(px), y.find_bin(py)) {
                cells[[i, j]].fill(value);
            }
        }
        let finished = cells.mapv(|cell| cell.finish(resolution));
        Self {
            x,
            y,
            content: finished.mapv(|(mean, _, _)| mean),
            error: finished.mapv(|(_, error, _)| error),
            count: finished.mapv(|(_, _, count)| count),
            suppressed: Array2::from_elem((x.bins, y.bins), false),
        }
    }

    pub const fn projection(&self) -> Projection {
        Projection::TwoDimensional
    }

    pub const fn x_grid(&self) -> &BinGrid {
        &self.x
    }

    pub const fn y_grid(&self) -> &BinGrid {
        &self.y
    }

    pub fn content(&self, i: usize, j: usize) -> f64 {
        self.content[[i, j]]
    }

    pub fn error(&self, i: usize, j: usize) -> f64 {
        self.error[[i, j]]
    }

    pub fn count(&self, i: usize, j: usize) -> u32 {
        self.count[[i, j]]
    }

    /// Whether cell `(i, j)` holds readings and is not suppressed.
    pub fn is_live(&self, i: usize, j: usize) -> bool {
        self.count[[i, j]] > 0 && !self.suppressed[[i, j]]
    }

    /// Zero content and error of the cell nearest each dead position.
    #[must_use]
    pub fn suppress_dead(mut self, dead: &[DeadPosition]) -> Self {
        for position in dead {
            let cell = [self.x.nearest_bin(position.x), self.y.nearest_bin(position.y)];
            self.content[cell] = 0.0;
            self.error[cell] = 0.0;
            self.suppressed[cell] = true;
        }
        self
    }

    /// Average the live cells of `range` (rows of the other axis) onto `axis`.
    ///
    /// Empty and suppressed cells are left out of the average. The range is clamped to the
    /// grid.
    pub fn project(&self, axis: Axis, range: Option<Range<usize>>) -> ResponseProfile {
        let (grid, lanes, other_bins) = match axis {
            Axis::X => (self.x, ArrayAxis(0), self.y.bins),
            Axis::Y => (self.y, ArrayAxis(1), self.x.bins),
        };
        let range = range.unwrap_or(0..other_bins);
        let range = range.start.min(other_bins)..range.end.min(other_bins);

        let mut content = Array1::zeros(grid.bins);
        let mut error = Array1::zeros(grid.bins);
        let mut count = Array1::zeros(grid.bins);
        for (bin, (((values, errors), counts), suppressed)) in self
            .content
            .axis_iter(lanes)
            .zip(self.error.axis_iter(lanes))
            .zip(self.count.axis_iter(lanes))
            .zip(self.suppressed.axis_iter(lanes))
            .enumerate()
        {
            let used = range
                .clone()
                .filter(|&k| counts[k] > 0 && !suppressed[k])
                .collect::<Vec<_>>();
            if used.is_empty() {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let n = used.len() as f64;
            content[bin] = used.iter().map(|&k| values[k]).sum::<f64>() / n;
            error[bin] = used.iter().map(|&k| errors[k].powi(2)).sum::<f64>().sqrt() / n;
            count[bin] = used.iter().map(|&k| counts[k]).sum();
        }

        ResponseProfile {
            axis,
            grid,
            content,
            error,
            count,
            suppressed: Array1::from_elem(grid.bins, false),
        }
    }
}

/// One bin of a profile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileBin {
    pub center: f64,
    pub value: f64,
    pub count: u32,
    pub error: f64,
    /// Holds readings and is not suppressed
    pub live: bool,
}

impl ProfileBin {
    /// Inverse-variance weight; zero for bins that must not enter a fit.
    pub fn weight(&self) -> f64 {
        if self.live && self.error > 0.0 {
            self.error.powi(-2)
        } else {
            0.0
        }
    }
}

/// Mean response along one positioner axis.
///
/// Suppressed bins keep their place in the sequence with zero content and zero error, and
/// are flagged so fits give them no weight.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseProfile {
    axis: Axis,
    grid: BinGrid,
    content: Array1<f64>,
    error: Array1<f64>,
    count: Array1<u32>,
    suppressed: Array1<bool>,
}

impl ResponseProfile {
    /// Bin `(x, value)` points along `axis`; points off the grid are dropped.
    pub fn from_points(
        axis: Axis,
        grid: BinGrid,
        resolution: f64,
        points: impl IntoIterator<Item = (f64, f64)>,
    ) -> Self {
        let mut bins = vec![Accumulator::default(); grid.bins];
        for (x, value) in points {
            if let Some(bin) = grid.find_bin(x) {
                bins[bin].fill(value);
            }
        }
        let finished = bins
            .into_iter()
            .map(|bin| bin.finish(resolution))
            .collect::<Vec<_>>();
        Self {
            axis,
            grid,
            content: finished.iter().map(|(mean, _, _)| *mean).collect(),
            error: finished.iter().map(|(_, error, _)| *error).collect(),
            count: finished.iter().map(|(_, _, count)| *count).collect(),
            suppressed: Array1::from_elem(grid.bins, false),
        }
    }

    /// Build a profile from per-bin arrays. Bins with a count are live.
    ///
    /// # Errors
    /// Returns [`Error::Shape`] if an array length does not match the grid.
    pub fn from_bins(
        axis: Axis,
        grid: BinGrid,
        content: Array1<f64>,
        error: Array1<f64>,
        count: Array1<u32>,
    ) -> Result<Self> {
        if [content.len(), error.len(), count.len()]
            .iter()
            .any(|&len| len != grid.bins)
        {
            return Err(Error::Shape(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            )));
        }
        Ok(Self {
            axis,
            grid,
            content,
            error,
            count,
            suppressed: Array1::from_elem(grid.bins, false),
        })
    }

    pub const fn axis(&self) -> Axis {
        self.axis
    }

    pub const fn projection(&self) -> Projection {
        match self.axis {
            Axis::X => Projection::XProjected,
            Axis::Y => Projection::YProjected,
        }
    }

    pub const fn grid(&self) -> &BinGrid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.grid.bins
    }

    pub fn is_empty(&self) -> bool {
        self.grid.bins == 0
    }

    pub const fn content(&self) -> &Array1<f64> {
        &self.content
    }

    pub const fn error(&self) -> &Array1<f64> {
        &self.error
    }

    pub fn bins(&self) -> impl Iterator<Item = ProfileBin> + '_ {
        (0..self.grid.bins).map(|bin| ProfileBin {
            center: self.grid.center(bin),
            value: self.content[bin],
            count: self.count[bin],
            error: self.error[bin],
            live: self.count[bin] > 0 && !self.suppressed[bin],
        })
    }

    /// Number of bins carrying fit weight.
    pub fn weighted_bins(&self) -> usize {
        self.bins().filter(|bin| bin.weight() > 0.0).count()
    }

    /// Zero content and error of the bin nearest each dead position along this profile's
    /// axis.
    #[must_use]
    pub fn suppress_dead(mut self, dead: &[DeadPosition]) -> Self {
        for position in dead {
            let coordinate = match self.axis {
                Axis::X => position.x,
                Axis::Y => position.y,
            };
            let bin = self.grid.nearest_bin(coordinate);
            self.content[bin] = 0.0;
            self.error[bin] = 0.0;
            self.suppressed[bin] = true;
        }
        self
    }

    /// The same profile with bin centers measured from `origin`.
    #[must_use]
    pub fn shifted(&self, origin: f64) -> Self {
        Self {
            grid: self.grid.shifted(origin),
            ..self.clone()
        }
    }
}

/// Turns samples of one scan into maps and profiles of a single channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileBuilder {
    pub x: BinGrid,
    pub y: BinGrid,
    /// Samples below this beam current are not binned
    pub min_beam_current: f64,
    /// Multiplies the beam current before normalization
    pub beam_scale: f64,
    /// Smallest resolvable change of a normalized response
    pub resolution: f64,
    pub dead: Vec<DeadPosition>,
}

impl ProfileBuilder {
    /// Pedestal-subtracted response of `channel` per unit beam current, binned by
    /// positioner readback, with dead cells suppressed.
    ///
    /// # Errors
    /// Returns an error if a binned sample has no pedestal.
    pub fn build_map(
        &self,
        samples: &[QuadrantSample],
        pedestals: &PedestalSet,
        channel: Channel,
    ) -> Result<ResponseMap> {
        Ok(self.unsuppressed_map(samples, pedestals, channel)?.suppress_dead(&self.dead))
    }

    /// Profile of `channel` along `axis`, averaged over `range` of the other axis.
    ///
    /// # Errors
    /// Returns an error if a binned sample has no pedestal.
    pub fn build_profile(
        &self,
        samples: &[QuadrantSample],
        pedestals: &PedestalSet,
        channel: Channel,
        axis: Axis,
        range: Option<Range<usize>>,
    ) -> Result<ResponseProfile> {
        Ok(self
            .unsuppressed_map(samples, pedestals, channel)?
            .project(axis, range)
            .suppress_dead(&self.dead))
    }

    fn unsuppressed_map(
        &self,
        samples: &[QuadrantSample],
        pedestals: &PedestalSet,
        channel: Channel,
    ) -> Result<ResponseMap> {
        let mut points = vec![];
        for sample in samples
            .iter()
            .filter(|sample| sample.beam_current > self.min_beam_current)
        {
            let currents = pedestals.subtract(sample)?;
            points.push((
                sample.reference_x,
                sample.reference_y,
                currents[channel] / (sample.beam_current * self.beam_scale),
            ));
        }
        Ok(ResponseMap::from_points(self.x, self.y, self.resolution, points))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{BinGrid, DeadPosition, Projection, ResponseMap, ResponseProfile, DEFAULT_RESOLUTION};
    use crate::channel::Axis;

    fn scan_grids() -> (BinGrid, BinGrid) {
        (
            BinGrid::new(9, -116.75, -112.25).unwrap(),
            BinGrid::new(9, 2.75, 7.25).unwrap(),
        )
    }

    fn filled_map() -> ResponseMap {
        let (x, y) = scan_grids();
        let mut points = vec![];
        for i in 0..x.bins {
            for j in 0..y.bins {
                let value = 10.0 * i as f64 + j as f64;
                points.push((x.center(i), y.center(j), value - 0.5));
                points.push((x.center(i), y.center(j), value + 0.5));
            }
        }
        ResponseMap::from_points(x, y, DEFAULT_RESOLUTION, points)
    }

    #[test]
    fn grids_locate_bins() {
        let (x, _) = scan_grids();
        approx::assert_relative_eq!(x.width(), 0.5);
        approx::assert_relative_eq!(x.center(0), -116.5);
        assert_eq!(x.find_bin(-116.5), Some(0));
        assert_eq!(x.find_bin(-112.3), Some(8));
        assert_eq!(x.find_bin(-112.25), None);
        assert_eq!(x.nearest_bin(-200.0), 0);
        assert_eq!(x.nearest_bin(0.0), 8);
        assert!(BinGrid::new(0, 0.0, 1.0).is_err());
        assert!(BinGrid::new(4, 1.0, 1.0).is_err());
    }

    #[test]
    fn cells_hold_mean_and_standard_error() {
        let map = filled_map();
        assert_eq!(map.projection(), Projection::TwoDimensional);
        approx::assert_relative_eq!(map.content(2, 3), 23.0);
        approx::assert_relative_eq!(
            map.error(2, 3),
            (0.25 + DEFAULT_RESOLUTION.powi(2)).sqrt() / 2f64.sqrt()
        );
        assert_eq!(map.count(2, 3), 2);
    }

    #[test]
    fn repeated_readings_keep_the_resolution_as_error() {
        let (x, y) = scan_grids();
        let resolution = 1e-3;
        let (cx, cy) = (x.center(1), y.center(1));
        let identical = [1000.1; 4].map(|value| (cx, cy, value));
        let spread = [1000.0, 1000.001, 1000.0, 1000.001].map(|value| (x.center(2), cy, value));
        let map = ResponseMap::from_points(x, y, resolution, identical.into_iter().chain(spread));

        approx::assert_relative_eq!(map.content(1, 1), 1000.1);
        approx::assert_relative_eq!(map.error(1, 1), resolution / 2.0, max_relative = 1e-6);
        approx::assert_relative_eq!(
            map.error(2, 1),
            (0.0005f64.powi(2) + resolution.powi(2)).sqrt() / 2.0,
            max_relative = 1e-6
        );
        assert!(map.error(2, 1) / map.error(1, 1) < 2.0);
        assert!(!map.is_live(0, 0));
    }

    #[test]
    fn zero_readings_are_live_cells() {
        let (x, y) = scan_grids();
        let points = [(x.center(0), y.center(0), 0.0), (x.center(0), y.center(1), 2.0)];
        let map = ResponseMap::from_points(x, y, DEFAULT_RESOLUTION, points);
        assert!(map.is_live(0, 0));
        approx::assert_relative_eq!(map.error(0, 0), DEFAULT_RESOLUTION);

        let profile = map.project(Axis::X, Some(0..2));
        approx::assert_relative_eq!(profile.content()[0], 1.0);
        assert_eq!(profile.weighted_bins(), 1);
    }

    #[test]
    fn projection_averages_over_the_requested_rows() {
        let map = filled_map();
        let profile = map.project(Axis::X, Some(2..5));
        assert_eq!(profile.projection(), Projection::XProjected);
        assert_eq!(profile.len(), 9);
        for (i, bin) in profile.bins().enumerate() {
            approx::assert_relative_eq!(bin.value, 10.0 * i as f64 + 3.0);
            assert_eq!(bin.count, 6);
        }

        let profile = map.project(Axis::Y, None);
        assert_eq!(profile.projection(), Projection::YProjected);
        approx::assert_relative_eq!(profile.content()[1], 41.0);
    }

    #[test]
    fn suppressed_cells_drop_out_of_projections() {
        let map = filled_map().suppress_dead(&[DeadPosition { x: -116.5, y: 3.0 }]);
        approx::assert_relative_eq!(map.content(0, 0), 0.0);
        approx::assert_relative_eq!(map.error(0, 0), 0.0);
        approx::assert_relative_eq!(map.content(0, 1), 1.0);

        assert!(!map.is_live(0, 0));

        let profile = map.project(Axis::X, Some(0..2));
        approx::assert_relative_eq!(profile.content()[0], 1.0);
    }

    #[test]
    fn suppressed_profile_bins_carry_no_weight() {
        let profile = filled_map().project(Axis::X, None);
        assert_eq!(profile.weighted_bins(), 9);
        let suppressed = profile.suppress_dead(&[DeadPosition { x: -115.0, y: 0.0 }]);
        assert_eq!(suppressed.weighted_bins(), 8);
        let bin = suppressed.bins().nth(3).unwrap();
        assert!(!bin.live);
        assert_eq!(bin.weight(), 0.0);
    }

    proptest! {
        #[test]
        fn dead_positions_zero_only_their_nearest_bin(
            dead_x in -118.0..-111.0f64,
        ) {
            let profile = filled_map().project(Axis::X, None);
            let suppressed = profile.clone().suppress_dead(&[DeadPosition { x: dead_x, y: 100.0 }]);
            let target = profile.grid().nearest_bin(dead_x);

            prop_assert_eq!(suppressed.len(), profile.len());
            for (bin, (before, after)) in profile.bins().zip(suppressed.bins()).enumerate() {
                if bin == target {
                    prop_assert_eq!(after.value, 0.0);
                    prop_assert_eq!(after.error, 0.0);
                } else {
                    prop_assert_eq!(before, after);
                }
            }
        }
    }

    #[test]
    fn y_profiles_suppress_on_the_y_coordinate() {
        let profile = filled_map()
            .project(Axis::Y, None)
            .suppress_dead(&[DeadPosition { x: -116.5, y: 6.5 }]);
        approx::assert_relative_eq!(profile.content()[7], 0.0);
        approx::assert_relative_eq!(profile.error()[7], 0.0);
        assert!(profile.error()[0] > 0.0);
    }

    #[test]
    fn shifted_profiles_keep_their_bins() {
        let profile = filled_map().project(Axis::X, None);
        let shifted = profile.shifted(-114.5);
        approx::assert_relative_eq!(shifted.grid().center(4), 0.0);
        assert_eq!(shifted.content(), profile.content());
        let points = ResponseProfile::from_points(
            Axis::X,
            *profile.grid(),
            DEFAULT_RESOLUTION,
            [(-114.5, 3.0)],
        );
        approx::assert_relative_eq!(points.content()[4], 3.0);
    }
}
