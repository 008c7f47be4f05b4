//! Configuration reconciliation
//!
//! Before each submission the encode thread compares the persisted
//! configuration against the backend's live values and writes only the
//! properties that differ. Rewriting an unchanged property can make a device
//! restart its internal state (a new GOP, rate-control reset), so skipping
//! identical writes keeps the stream stable.

use tracing::{debug, trace};

use crate::backend::{BackendError, BackendResult, EncoderBackend, Property, PropertyValue};
use crate::config::EncoderConfig;

use super::Resolution;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Properties that were written
    pub written: Vec<Property>,
    /// Properties whose live value already matched
    pub unchanged: usize,
    /// Properties the backend does not support
    pub unsupported: Vec<Property>,
}

impl ReconcileReport {
    /// Nothing was written
    pub fn is_noop(&self) -> bool {
        self.written.is_empty()
    }
}

/// Desired property values for a frame at `resolution`
pub fn desired_properties(
    config: &EncoderConfig,
    resolution: Resolution,
) -> Vec<(Property, PropertyValue)> {
    let mut desired = vec![
        (Property::Resolution, PropertyValue::Resolution(resolution)),
        (Property::Framerate, PropertyValue::Uint(config.framerate)),
        (Property::Preset, PropertyValue::Preset(config.preset)),
        (Property::Bitrate, PropertyValue::Uint(config.bitrate)),
        (Property::MaxBitrate, PropertyValue::Uint(config.max_bitrate)),
    ];

    if let Some(mode) = config.rate_control() {
        desired.push((Property::RateControl, PropertyValue::RateControl(mode)));
    }
    if let Some(qp) = config.quantization() {
        desired.push((Property::Quantization, PropertyValue::Uint(qp)));
    }
    for (name, value) in config.custom_options() {
        desired.push((
            Property::Custom(name.to_string()),
            PropertyValue::Text(value.to_string()),
        ));
    }

    desired
}

/// Pushes configuration deltas to a backend
#[derive(Debug, Default)]
pub struct ConfigReconciler {
    writes: u64,
    skipped: u64,
}

impl ConfigReconciler {
    /// Create a reconciler with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the backend in line with `config`
    ///
    /// Unsupported properties are skipped; any other backend error aborts
    /// the pass and is returned.
    pub fn reconcile(
        &mut self,
        backend: &mut dyn EncoderBackend,
        config: &EncoderConfig,
        resolution: Resolution,
    ) -> BackendResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for (property, value) in desired_properties(config, resolution) {
            match self.apply(backend, &property, &value) {
                Ok(true) => report.written.push(property),
                Ok(false) => report.unchanged += 1,
                Err(BackendError::UnsupportedProperty(_)) => {
                    trace!("{}: property {} unsupported, skipping", backend.name(), property);
                    report.unsupported.push(property);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.is_noop() {
            debug!(
                "{}: reconciled {:?} ({} unchanged)",
                backend.name(),
                report.written,
                report.unchanged
            );
        }

        Ok(report)
    }

    /// Write a single property if its live value differs
    ///
    /// Returns whether a write happened.
    pub fn apply(
        &mut self,
        backend: &mut dyn EncoderBackend,
        property: &Property,
        value: &PropertyValue,
    ) -> BackendResult<bool> {
        let live = match backend.get_property(property) {
            Ok(live) => live,
            // Write-only properties are always written
            Err(BackendError::UnsupportedProperty(_)) if matches!(property, Property::Custom(_)) => {
                None
            }
            Err(e) => return Err(e),
        };

        if live.as_ref() == Some(value) {
            self.skipped += 1;
            return Ok(false);
        }

        backend.set_property(property, value)?;
        self.writes += 1;
        Ok(true)
    }

    /// Total property writes issued
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Total writes avoided because the live value matched
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
