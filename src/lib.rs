#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

// Links the BLAS backend used by `ndarray` and `ndarray-linalg`.
extern crate blas_src;

pub mod align;
pub mod archive;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod fitting;
pub mod histogram;
pub mod linearity;
pub(crate) mod minimisation;
pub mod pedestal;
pub(crate) mod polyfit;
pub mod sample;
pub mod session;
pub mod solver;
pub mod source;
pub mod spectrum;
pub mod store;
pub mod transit;

pub use error::Error;

pub type Result<T> = ::std::result::Result<T, Error>;
