//! Drift-correction data types shared between the drift scheduler and its
//! external drift-estimation oracle.

use super::scan::ProbePosition;
use crate::units::LengthUnit;
use serde::{Deserialize, Serialize};

/// A single drift measurement between two scans of (nominally) the same
/// region, as produced by an external drift-estimation oracle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSnapshot {
    /// Estimated shift of the sample in X since the reference scan.
    pub offset_x: f64,
    /// Estimated shift of the sample in Y since the reference scan.
    pub offset_y: f64,
    /// Unit of `offset_x`/`offset_y`.
    pub length_unit: LengthUnit,
    /// Oracle-reported confidence in this estimate, in `[0.0, 1.0]`.
    pub fit_score: f64,
    /// Wall-clock time the estimate was produced.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The drift scheduler's running correction state:
/// `(timestamp t, vector v, rate r, length-unit)`. Represents the
/// cumulative tip-to-sample offset known at time `t` and the instantaneous
/// rate of change of that offset, so a caller can evaluate the offset at any
/// later instant by rate-extrapolation rather than only at `t` itself.
///
/// `T(now) = v + r * (now - t)`, evaluated component-wise in X and Y via
/// [`CorrectionInfo::evaluate`]. `v`/`r` are always stored in
/// meters (and meters/second for `r`) regardless of the unit a given
/// snapshot or payload arrives in; conversion happens at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionInfo {
    /// Reference time `t` at which `v` was the correction offset.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Cumulative offset `v` in X at `timestamp`, in meters.
    pub offset_x: f64,
    /// Cumulative offset `v` in Y at `timestamp`, in meters.
    pub offset_y: f64,
    /// Instantaneous rate `r` in X, in meters/second.
    pub rate_x: f64,
    /// Instantaneous rate `r` in Y, in meters/second.
    pub rate_y: f64,
}

impl Default for CorrectionInfo {
    fn default() -> Self {
        Self {
            timestamp: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            offset_x: 0.0,
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        }
    }
}

impl CorrectionInfo {
    /// Fold a new drift snapshot into the running correction via a weighted
    /// blend of the pre-existing rate-extrapolated estimate and the new
    /// snapshot-derived estimate, re-basing `t` to the snapshot's timestamp
    /// and re-deriving `r` from the change in offset over the elapsed
    /// interval. `weight` must be in `(0, 1]` and is the share given to the
    /// new snapshot.
    pub fn blend(&mut self, snapshot: &DriftSnapshot, weight: f64, target_unit: LengthUnit) {
        let extrapolated = self.evaluate(snapshot.timestamp, target_unit);
        let snapshot_x = crate::units::convert_length(snapshot.offset_x, snapshot.length_unit, target_unit);
        let snapshot_y = crate::units::convert_length(snapshot.offset_y, snapshot.length_unit, target_unit);

        let blended_x = (1.0 - weight) * extrapolated.0 + weight * snapshot_x;
        let blended_y = (1.0 - weight) * extrapolated.1 + weight * snapshot_y;

        let elapsed_s = (snapshot.timestamp - self.timestamp).num_milliseconds() as f64 / 1000.0;
        let (new_rate_x, new_rate_y) = if elapsed_s > 0.0 {
            (
                (blended_x - self.offset_x_in(target_unit)) / elapsed_s,
                (blended_y - self.offset_y_in(target_unit)) / elapsed_s,
            )
        } else {
            (self.rate_x, self.rate_y)
        };

        self.timestamp = snapshot.timestamp;
        self.offset_x = crate::units::convert_length(blended_x, target_unit, LengthUnit::Meter);
        self.offset_y = crate::units::convert_length(blended_y, target_unit, LengthUnit::Meter);
        self.rate_x = crate::units::convert_length(new_rate_x, target_unit, LengthUnit::Meter);
        self.rate_y = crate::units::convert_length(new_rate_y, target_unit, LengthUnit::Meter);
    }

    /// Evaluate `T(now) = v + r * (now - t)` in the given unit.
    pub fn evaluate(&self, now: chrono::DateTime<chrono::Utc>, unit: LengthUnit) -> (f64, f64) {
        let elapsed_s = (now - self.timestamp).num_milliseconds() as f64 / 1000.0;
        let x_m = self.offset_x + self.rate_x * elapsed_s;
        let y_m = self.offset_y + self.rate_y * elapsed_s;
        (
            crate::units::convert_length(x_m, LengthUnit::Meter, unit),
            crate::units::convert_length(y_m, LengthUnit::Meter, unit),
        )
    }

    /// Apply `point ← point + T(now)` (sample-frame → tip-frame), as the
    /// Router does to a write request before forwarding it upstream.
    pub fn apply_forward(&self, position: ProbePosition, now: chrono::DateTime<chrono::Utc>) -> ProbePosition {
        let (dx, dy) = self.evaluate(now, position.length_unit);
        ProbePosition {
            x: position.x + dx,
            y: position.y + dy,
            length_unit: position.length_unit,
        }
    }

    /// Apply `point ← point − T(now)` (tip-frame → sample-frame), as the
    /// Cache does to a publication before forwarding it downstream.
    pub fn apply_inverse(&self, position: ProbePosition, now: chrono::DateTime<chrono::Utc>) -> ProbePosition {
        let (dx, dy) = self.evaluate(now, position.length_unit);
        ProbePosition {
            x: position.x - dx,
            y: position.y - dy,
            length_unit: position.length_unit,
        }
    }

    fn offset_x_in(&self, unit: LengthUnit) -> f64 {
        crate::units::convert_length(self.offset_x, LengthUnit::Meter, unit)
    }

    fn offset_y_in(&self, unit: LengthUnit) -> f64 {
        crate::units::convert_length(self.offset_y, LengthUnit::Meter, unit)
    }
}

/// One row of the persisted drift log, one per arriving qualifying scan:
/// `datetime, filename, corr_offset_x, corr_offset_y, corr_offset_units,
/// corr_rate_x, corr_rate_y, corr_rate_units, scan_matched`. A missing
/// correction is serialized as empty cells.
#[derive(Debug, Clone, Serialize)]
pub struct DriftLogRow {
    /// ISO-8601 UTC timestamp of this row.
    pub datetime: chrono::DateTime<chrono::Utc>,
    /// Identifier of the scan this row concerns.
    pub filename: String,
    /// `CorrectionInfo.v` evaluated at `datetime`, X component.
    pub corr_offset_x: Option<f64>,
    /// `CorrectionInfo.v` evaluated at `datetime`, Y component.
    pub corr_offset_y: Option<f64>,
    /// Unit of `corr_offset_x`/`corr_offset_y`.
    pub corr_offset_units: Option<LengthUnit>,
    /// `CorrectionInfo.r`, X component.
    pub corr_rate_x: Option<f64>,
    /// `CorrectionInfo.r`, Y component.
    pub corr_rate_y: Option<f64>,
    /// Unit of `corr_rate_x`/`corr_rate_y` (length unit per second).
    pub corr_rate_units: Option<LengthUnit>,
    /// Whether the true scan region intersected the expected region above
    /// the configured threshold (the rescan trigger's own check).
    pub scan_matched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_extrapolates_by_rate() {
        // CorrectionInfo = (t0, v=(1,0) nm, r=(0,0), nm).
        let t0 = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let info = CorrectionInfo {
            timestamp: t0,
            offset_x: crate::units::convert_length(1.0, LengthUnit::Nanometer, LengthUnit::Meter),
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let (x, y) = info.evaluate(t0, LengthUnit::Nanometer);
        assert!((x - 1.0).abs() < 1e-9);
        assert!((y - 0.0).abs() < 1e-9);
    }

    #[test]
    fn forward_and_inverse_are_mutual_inverses() {
        let t0 = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let info = CorrectionInfo {
            timestamp: t0,
            offset_x: 1e-9,
            offset_y: 2e-9,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let now = t0 + chrono::Duration::seconds(5);
        let original = ProbePosition {
            x: 10.0,
            y: 20.0,
            length_unit: LengthUnit::Nanometer,
        };
        let forwarded = info.apply_forward(original, now);
        let back = info.apply_inverse(forwarded, now);
        assert!((back.x - original.x).abs() < 1e-9);
        assert!((back.y - original.y).abs() < 1e-9);
    }

    #[test]
    fn blend_rebases_timestamp_to_snapshot() {
        let t0 = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut info = CorrectionInfo {
            timestamp: t0,
            offset_x: 0.0,
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let snapshot = DriftSnapshot {
            offset_x: 2.0,
            offset_y: 0.0,
            length_unit: LengthUnit::Nanometer,
            fit_score: 0.9,
            timestamp: t0 + chrono::Duration::seconds(2),
        };
        info.blend(&snapshot, 1.0, LengthUnit::Nanometer);
        assert_eq!(info.timestamp, snapshot.timestamp);
        let (x, _) = info.evaluate(snapshot.timestamp, LengthUnit::Nanometer);
        assert!((x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn round_trip_probe_position_scenario_six() {
        // Client sends top-left (0,0) nm; translator receives (1,0) nm;
        // translator publishes ROI top-left (1,0) nm; downstream
        // subscribers of the drift scheduler see (0,0) nm.
        let t0 = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let info = CorrectionInfo {
            timestamp: t0,
            offset_x: crate::units::convert_length(1.0, LengthUnit::Nanometer, LengthUnit::Meter),
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let requested = ProbePosition {
            x: 0.0,
            y: 0.0,
            length_unit: LengthUnit::Nanometer,
        };
        let received_by_translator = info.apply_forward(requested, t0);
        assert!((received_by_translator.x - 1.0).abs() < 1e-9);

        let published = received_by_translator;
        let seen_downstream = info.apply_inverse(published, t0);
        assert!((seen_downstream.x - 0.0).abs() < 1e-9);
    }
}
