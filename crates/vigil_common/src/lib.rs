//! Shared value types for the Vigil simulation debugging harness.
//!
//! This crate provides four-state logic values and packed port vectors,
//! clock frequencies with femtosecond period conversion, and the record
//! checksum used by the waveform spool.

#![warn(missing_docs)]

pub mod checksum;
pub mod frequency;
pub mod logic;
pub mod logic_vec;

pub use checksum::RecordChecksum;
pub use frequency::{Frequency, ParseFrequencyError};
pub use logic::Logic;
pub use logic_vec::{LogicVec, ParseLogicVecError};
