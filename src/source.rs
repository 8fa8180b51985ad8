use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{Currents, Gain};
use crate::sample::{QuadrantSample, TimeWindow};
use crate::Result;

/// Read-only access to recorded collimator samples.
pub trait SampleSource {
    /// Samples inside `window`, restricted to `gain` when given, in recording order.
    ///
    /// # Errors
    /// Returns an error if the backing store cannot be read.
    fn samples(&self, window: &TimeWindow, gain: Option<Gain>) -> Result<Vec<QuadrantSample>>;
}

fn selected(sample: &QuadrantSample, window: &TimeWindow, gain: Option<Gain>) -> bool {
    window.contains(sample.timestamp) && gain.map_or(true, |gain| gain == sample.gain)
}

/// Samples already held in memory, for example the result of an archive query.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    samples: Vec<QuadrantSample>,
}

impl MemorySource {
    pub fn new(samples: Vec<QuadrantSample>) -> Self {
        Self { samples }
    }
}

impl SampleSource for MemorySource {
    fn samples(&self, window: &TimeWindow, gain: Option<Gain>) -> Result<Vec<QuadrantSample>> {
        Ok(self
            .samples
            .iter()
            .filter(|sample| selected(sample, window, gain))
            .cloned()
            .collect())
    }
}

/// On-disk row layout of an exported sample stream.
#[derive(Debug, Deserialize, Serialize)]
pub struct Row {
    pub timestamp: f64,
    pub gain: u8,
    pub ixp: f64,
    pub ixm: f64,
    pub iyp: f64,
    pub iym: f64,
    pub oxp: f64,
    pub oxm: f64,
    pub oyp: f64,
    pub oym: f64,
    pub beam_current: f64,
    pub reference_x: f64,
    pub reference_y: f64,
}

impl From<Row> for QuadrantSample {
    fn from(row: Row) -> Self {
        Self {
            timestamp: row.timestamp,
            gain: Gain(row.gain),
            currents: Currents::new([
                row.ixp, row.ixm, row.iyp, row.iym, row.oxp, row.oxm, row.oyp, row.oym,
            ]),
            beam_current: row.beam_current,
            reference_x: row.reference_x,
            reference_y: row.reference_y,
        }
    }
}

impl From<&QuadrantSample> for Row {
    fn from(sample: &QuadrantSample) -> Self {
        let [ixp, ixm, iyp, iym, oxp, oxm, oyp, oym] = *sample.currents.values();
        Self {
            timestamp: sample.timestamp,
            gain: sample.gain.0,
            ixp,
            ixm,
            iyp,
            iym,
            oxp,
            oxm,
            oyp,
            oym,
            beam_current: sample.beam_current,
            reference_x: sample.reference_x,
            reference_y: sample.reference_y,
        }
    }
}

/// Samples exported to CSV files, read in file order.
pub struct CsvSource {
    paths: Vec<PathBuf>,
}

impl CsvSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    fn read_file(path: &Path) -> Result<Vec<QuadrantSample>> {
        let file = fs::read(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(&file[..]);

        let mut samples = vec![];
        for result in rdr.deserialize() {
            let record: Row = result?;
            samples.push(QuadrantSample::from(record));
        }
        debug!(path = %path.display(), rows = samples.len(), "read sample file");
        Ok(samples)
    }
}

impl SampleSource for CsvSource {
    fn samples(&self, window: &TimeWindow, gain: Option<Gain>) -> Result<Vec<QuadrantSample>> {
        let mut samples = vec![];
        for path in &self.paths {
            samples.extend(
                Self::read_file(path)?
                    .into_iter()
                    .filter(|sample| selected(sample, window, gain)),
            );
        }
        Ok(samples)
    }
}

/// Write samples in the layout [`CsvSource`] reads.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_csv(path: &Path, samples: &[QuadrantSample]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for sample in samples {
        wtr.serialize(Row::from(sample))?;
    }
    wtr.flush()?;
    Ok(())
}
