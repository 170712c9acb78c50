//! Adaptive anti-cycling control for heat-pump compressors.
//!
//! Power history is partitioned into operating regions ([`discovery`]), the live signal is
//! scored for cycling ([`observer`], [`signal`]) and [`controller`] turns both into unit
//! actions. [`service`] runs the loops around them.

pub mod config;
pub mod controller;
pub mod counters;
pub mod discovery;
pub mod episode;
pub mod error;
pub mod observer;
pub mod predictor;
pub mod replay;
pub mod rolling;
pub mod service;
pub mod signal;
pub mod types;

pub use error::{StabilityError, StabilityResult};
