//! Seek lead calibration
//!
//! Embedded players take a moment to resume after a seek, so a corrective
//! seek lands behind the DJ unless it aims slightly ahead. The lead is
//! learned from the drift observed on the first reconciliation after each
//! corrective seek.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Lead used before any measurement (ms)
const DEFAULT_LEAD_MS: f64 = 250.0;

const MIN_LEAD_MS: f64 = 0.0;
const MAX_LEAD_MS: f64 = 2000.0;

/// Smoothing for ordinary measurements
const EMA_ALPHA: f64 = 0.2;

/// Smoothing for the first few measurements
const WARMUP_ALPHA: f64 = 0.4;
const WARMUP_SAMPLES: u32 = 3;

/// Drift beyond this is most likely a buffering stall, not seek latency
const OUTLIER_DRIFT_MS: f64 = 1500.0;
const OUTLIER_ALPHA: f64 = 0.05;

#[derive(Debug)]
pub struct SeekLeadCalibrator {
    lead_ms: f64,
    samples: u32,
    awaiting_measurement: bool,
}

impl SeekLeadCalibrator {
    pub fn new() -> Self {
        Self {
            lead_ms: DEFAULT_LEAD_MS,
            samples: 0,
            awaiting_measurement: false,
        }
    }

    /// Current lead in seconds
    pub fn lead_secs(&self) -> f64 {
        self.lead_ms / 1000.0
    }

    pub fn lead_ms(&self) -> u64 {
        self.lead_ms.round() as u64
    }

    pub fn is_awaiting_measurement(&self) -> bool {
        self.awaiting_measurement
    }

    /// A corrective seek was issued; the next drift reading measures it
    pub fn mark_seek(&mut self) {
        self.awaiting_measurement = true;
    }

    /// Feed the drift (local minus DJ, ms) seen after a corrective seek.
    /// Returns whether a measurement was taken.
    ///
    /// Behind the DJ (negative drift) raises the lead, ahead lowers it.
    pub fn measure(&mut self, drift_ms: f64) -> bool {
        if !self.awaiting_measurement {
            return false;
        }
        self.awaiting_measurement = false;
        self.samples = self.samples.saturating_add(1);

        let ideal = self.lead_ms - drift_ms;
        let alpha = if drift_ms.abs() > OUTLIER_DRIFT_MS {
            OUTLIER_ALPHA
        } else if self.samples <= WARMUP_SAMPLES {
            WARMUP_ALPHA
        } else {
            EMA_ALPHA
        };

        self.lead_ms = (alpha * ideal + (1.0 - alpha) * self.lead_ms).clamp(MIN_LEAD_MS, MAX_LEAD_MS);
        debug!(
            "Seek lead: drift={:+.0}ms ideal={:.0}ms lead={:.0}ms (samples={})",
            drift_ms, ideal, self.lead_ms, self.samples
        );
        true
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SeekLeadCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedCalibrator = Arc<RwLock<SeekLeadCalibrator>>;

pub fn new_shared_calibrator() -> SharedCalibrator {
    Arc::new(RwLock::new(SeekLeadCalibrator::new()))
}
