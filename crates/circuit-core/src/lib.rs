//! # Circuit Core
//!
//! Shared types for declarative circuit assembly and simulation.
//!
//! ## Design Philosophy
//!
//! 1. Identifiers, not object handles, are the durable cross-reference:
//!    neurons are named by dense global integers, engine objects by typed
//!    arena indices.
//! 2. Per-request lifetime: nothing here persists across simulation runs.
//! 3. Explicit errors over panics; best-effort skips are diagnostics, not
//!    error values.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CircuitError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (nA)
pub type Current = f64;

/// Conductance (uS for point processes, S/cm^2 for density mechanisms)
pub type Conductance = f64;

/// Dense zero-based global neuron identifier, unique within one request
pub type Gid = usize;

/// State vector for membrane integration
pub type StateVector = Array1<f64>;

/// Recorded voltage trace with synchronized time base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points (ms)
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Spike raster: (time, gid) pairs in the order detectors fired.
///
/// Events at the same simulated instant keep event-generation order;
/// the collection is never globally re-sorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpikeRaster {
    pub times: Vec<Time>,
    pub gids: Vec<Gid>,
}

impl SpikeRaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, time: Time, gid: Gid) {
        self.times.push(time);
        self.gids.push(gid);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.gids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Time, Gid)> + '_ {
        self.times.iter().copied().zip(self.gids.iter().copied())
    }

    /// Spike times grouped by sender gid
    pub fn spike_trains(&self) -> std::collections::HashMap<Gid, Vec<Time>> {
        let mut trains: std::collections::HashMap<Gid, Vec<Time>> = Default::default();
        for (t, gid) in self.iter() {
            trains.entry(gid).or_default().push(t);
        }
        trains
    }
}
