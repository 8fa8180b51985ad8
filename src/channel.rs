use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Discrete amplifier gain setting of the quadrant readout.
///
/// The code is what the acquisition records; the transimpedance it selects is
/// `10^(6 + code)` V/A, so code 3 is the 1e9 setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gain(pub u8);

impl Gain {
    pub fn transimpedance(self) -> f64 {
        10f64.powi(6 + i32::from(self.0))
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0e}", self.transimpedance())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ring {
    Inner,
    Outer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    X,
    Y,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Polarity {
    Plus,
    Minus,
}

/// One ring of the collimator along one axis, read out by a plus/minus channel pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorAxis {
    pub ring: Ring,
    pub axis: Axis,
}

impl SensorAxis {
    pub const ALL: [Self; 4] = [
        Self::new(Ring::Inner, Axis::X),
        Self::new(Ring::Inner, Axis::Y),
        Self::new(Ring::Outer, Axis::X),
        Self::new(Ring::Outer, Axis::Y),
    ];

    pub const fn new(ring: Ring, axis: Axis) -> Self {
        Self { ring, axis }
    }

    pub const fn plus(self) -> Channel {
        Channel::new(self.ring, self.axis, Polarity::Plus)
    }

    pub const fn minus(self) -> Channel {
        Channel::new(self.ring, self.axis, Polarity::Minus)
    }

    pub const fn label(self) -> &'static str {
        match (self.ring, self.axis) {
            (Ring::Inner, Axis::X) => "ix",
            (Ring::Inner, Axis::Y) => "iy",
            (Ring::Outer, Axis::X) => "ox",
            (Ring::Outer, Axis::Y) => "oy",
        }
    }
}

impl fmt::Display for SensorAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SensorAxis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|axis| axis.label() == s)
            .ok_or_else(|| Error::UnknownChannel(s.to_owned()))
    }
}

impl TryFrom<String> for SensorAxis {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SensorAxis> for String {
    fn from(value: SensorAxis) -> Self {
        value.label().to_owned()
    }
}

/// One of the eight physical quadrant readouts.
///
/// The set is closed: every sample carries exactly one value per channel, stored in
/// [`Channel::ALL`] order (`ixp ixm iyp iym oxp oxm oyp oym`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    pub ring: Ring,
    pub axis: Axis,
    pub polarity: Polarity,
}

impl Channel {
    pub const ALL: [Self; 8] = [
        Self::new(Ring::Inner, Axis::X, Polarity::Plus),
        Self::new(Ring::Inner, Axis::X, Polarity::Minus),
        Self::new(Ring::Inner, Axis::Y, Polarity::Plus),
        Self::new(Ring::Inner, Axis::Y, Polarity::Minus),
        Self::new(Ring::Outer, Axis::X, Polarity::Plus),
        Self::new(Ring::Outer, Axis::X, Polarity::Minus),
        Self::new(Ring::Outer, Axis::Y, Polarity::Plus),
        Self::new(Ring::Outer, Axis::Y, Polarity::Minus),
    ];

    pub const fn new(ring: Ring, axis: Axis, polarity: Polarity) -> Self {
        Self {
            ring,
            axis,
            polarity,
        }
    }

    pub const fn sensor_axis(self) -> SensorAxis {
        SensorAxis::new(self.ring, self.axis)
    }

    pub const fn index(self) -> usize {
        let ring = match self.ring {
            Ring::Inner => 0,
            Ring::Outer => 4,
        };
        let axis = match self.axis {
            Axis::X => 0,
            Axis::Y => 2,
        };
        let polarity = match self.polarity {
            Polarity::Plus => 0,
            Polarity::Minus => 1,
        };
        ring + axis + polarity
    }

    pub fn label(self) -> String {
        let polarity = match self.polarity {
            Polarity::Plus => 'p',
            Polarity::Minus => 'm',
        };
        format!("{}{polarity}", self.sensor_axis().label())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.label() == s)
            .ok_or_else(|| Error::UnknownChannel(s.to_owned()))
    }
}

impl TryFrom<String> for Channel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.label()
    }
}

/// One value per quadrant channel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Currents([f64; 8]);

impl Currents {
    pub const fn new(values: [f64; 8]) -> Self {
        Self(values)
    }

    pub fn from_fn(f: impl FnMut(usize) -> f64) -> Self {
        Self(std::array::from_fn(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL.into_iter().zip(self.0.iter().copied())
    }

    pub const fn values(&self) -> &[f64; 8] {
        &self.0
    }
}

impl Index<Channel> for Currents {
    type Output = f64;

    fn index(&self, channel: Channel) -> &Self::Output {
        &self.0[channel.index()]
    }
}

impl IndexMut<Channel> for Currents {
    fn index_mut(&mut self, channel: Channel) -> &mut Self::Output {
        &mut self.0[channel.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::{Axis, Channel, Currents, Gain, Polarity, Ring, SensorAxis};

    #[test]
    fn channel_indices_follow_acquisition_order() {
        for (ii, channel) in Channel::ALL.into_iter().enumerate() {
            assert_eq!(channel.index(), ii);
        }
        let labels = Channel::ALL.map(Channel::label);
        assert_eq!(
            labels,
            ["ixp", "ixm", "iyp", "iym", "oxp", "oxm", "oyp", "oym"].map(String::from)
        );
    }

    #[test]
    fn labels_parse_back_to_channels() {
        for channel in Channel::ALL {
            assert_eq!(channel.label().parse::<Channel>().unwrap(), channel);
        }
        assert!("ixz".parse::<Channel>().is_err());
        assert_eq!(
            "oy".parse::<SensorAxis>().unwrap(),
            SensorAxis::new(Ring::Outer, Axis::Y)
        );
    }

    #[test]
    fn sensor_axis_pairs_plus_and_minus_channels() {
        let axis = SensorAxis::new(Ring::Inner, Axis::Y);
        assert_eq!(axis.plus().polarity, Polarity::Plus);
        assert_eq!(axis.minus().polarity, Polarity::Minus);
        assert_eq!(axis.plus().sensor_axis(), axis);
    }

    #[test]
    fn gain_codes_map_to_transimpedance() {
        approx::assert_relative_eq!(Gain(3).transimpedance(), 1e9);
        approx::assert_relative_eq!(Gain(6).transimpedance(), 1e12);
    }

    #[test]
    fn currents_are_indexed_by_channel() {
        let mut currents = Currents::from_fn(|ii| ii as f64);
        let oym = Channel::new(Ring::Outer, Axis::Y, Polarity::Minus);
        approx::assert_relative_eq!(currents[oym], 7.0);
        currents[oym] = -1.0;
        approx::assert_relative_eq!(currents.values()[7], -1.0);
    }
}
