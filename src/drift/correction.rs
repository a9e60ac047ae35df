//! Candidate-scan matching and the drift oracle boundary for the
//! Drift-Corrected Scheduler (C10).
//!
//! Drift estimation itself is an image-registration problem (feature
//! matching plus outlier rejection between two scans of the same region)
//! with no natural in-process equivalent here; this crate keeps that
//! boundary external via [`DriftOracle`] rather than implementing a
//! registration algorithm.

use crate::messages::{DriftSnapshot, Scan2D, ScanParameters2D};
use crate::units::convert_length;
use async_trait::async_trait;

/// The boundary between the Drift-Corrected Scheduler and an external
/// image-registration routine: `estimate_drift(scan_a, scan_b,
/// max_fit_score) -> DriftSnapshot?`. Implementors accept or reject their
/// own fit internally against `max_fit_score` and return `None` rather than
/// a low-confidence snapshot.
#[async_trait]
pub trait DriftOracle: Send + Sync {
    /// Estimate the translation needed to align `scan_b` onto `scan_a`.
    async fn estimate_drift(
        &self,
        scan_a: &Scan2D,
        scan_b: &Scan2D,
        max_fit_score: f64,
    ) -> crate::error::Result<Option<DriftSnapshot>>;
}

/// Which matching scan to use when more than one candidate in the cache
/// sufficiently intersects a new scan's ROI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSelection {
    /// Prefer the earliest-timestamped match. Best when scans are
    /// infrequent, so comparing against the experiment's original position
    /// avoids accumulating per-scan correction error.
    Oldest,
    /// Prefer the most recently-timestamped match. Best when scans are
    /// frequent and the sample itself is non-static.
    Youngest,
}

fn rect_area(size_x: f64, size_y: f64) -> f64 {
    size_x * size_y
}

/// Intersection area divided by the area of the *smaller* of the two ROIs,
/// ignoring `angle` (unrotated rectangles only).
pub fn roi_intersection_ratio(a: &ScanParameters2D, b: &ScanParameters2D) -> f64 {
    let b_size_x = convert_length(b.size_x, b.length_unit, a.length_unit);
    let b_size_y = convert_length(b.size_y, b.length_unit, a.length_unit);
    let b_top_left_x = convert_length(b.top_left_x, b.length_unit, a.length_unit);
    let b_top_left_y = convert_length(b.top_left_y, b.length_unit, a.length_unit);

    let a_x1 = a.top_left_x;
    let a_x2 = a.top_left_x + a.size_x;
    let a_y1 = a.top_left_y;
    let a_y2 = a.top_left_y + a.size_y;

    let b_x1 = b_top_left_x;
    let b_x2 = b_top_left_x + b_size_x;
    let b_y1 = b_top_left_y;
    let b_y2 = b_top_left_y + b_size_y;

    let x1 = a_x1.min(a_x2).max(b_x1.min(b_x2));
    let y1 = a_y1.min(a_y2).max(b_y1.min(b_y2));
    let x2 = a_x1.max(a_x2).min(b_x1.max(b_x2));
    let y2 = a_y1.max(a_y2).min(b_y1.max(b_y2));

    if x2 < x1 || y2 < y1 {
        return 0.0;
    }

    let inter_area = rect_area(x2 - x1, y2 - y1);
    let smallest_area = rect_area(a.size_x, a.size_y).min(rect_area(b_size_x, b_size_y));
    if smallest_area <= 0.0 {
        return 0.0;
    }
    inter_area / smallest_area
}

/// Mean pixels-per-unit-length of a scan's parameters, in both axes.
fn spatial_resolution(params: &ScanParameters2D) -> f64 {
    let res_x = params.data_shape_x as f64 / params.size_x;
    let res_y = params.data_shape_y as f64 / params.size_y;
    (res_x + res_y) / 2.0
}

/// Ratio (in `[0, 1]`) of the smaller to the larger spatial resolution of
/// two scans' parameters. Too-dissimilar resolutions make keypoint matching
/// between the two images unreliable.
pub fn spatial_resolution_ratio(a: &ScanParameters2D, b: &ScanParameters2D) -> f64 {
    let (ra, rb) = (spatial_resolution(a), spatial_resolution(b));
    ra.min(rb) / ra.max(rb)
}

/// Find the `scans` candidate that sufficiently intersects `new_scan`'s ROI
/// and has a sufficiently similar spatial resolution, selecting among
/// multiple candidates per `selection`.
pub fn find_matching_scan<'a>(
    scans: &'a [Scan2D],
    new_scan: &Scan2D,
    min_intersection_ratio: f64,
    min_spatial_res_ratio: f64,
    selection: CandidateSelection,
) -> Option<&'a Scan2D> {
    let mut candidates: Vec<&Scan2D> = scans
        .iter()
        .filter(|scan| {
            roi_intersection_ratio(&scan.params, &new_scan.params) >= min_intersection_ratio
                && spatial_resolution_ratio(&scan.params, &new_scan.params) >= min_spatial_res_ratio
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by_key(|scan| scan.timestamp);
    match selection {
        CandidateSelection::Oldest => candidates.into_iter().next(),
        CandidateSelection::Youngest => candidates.into_iter().next_back(),
    }
}

/// Apply `point ← point + T(now)` (sample-frame → tip-frame) to a scan
/// region's top-left corner, as the Router does to a `SetScanParams`
/// request before forwarding it upstream.
pub fn apply_forward_scan_params(
    corr_info: &crate::messages::CorrectionInfo,
    params: ScanParameters2D,
    now: chrono::DateTime<chrono::Utc>,
) -> ScanParameters2D {
    let (dx, dy) = corr_info.evaluate(now, params.length_unit);
    ScanParameters2D {
        top_left_x: params.top_left_x + dx,
        top_left_y: params.top_left_y + dy,
        ..params
    }
}

/// Apply `point ← point − T(now)` (tip-frame → sample-frame) to a scan
/// region's top-left corner, as the Cache does to a publication before
/// forwarding it downstream.
pub fn apply_inverse_scan_params(
    corr_info: &crate::messages::CorrectionInfo,
    params: ScanParameters2D,
    now: chrono::DateTime<chrono::Utc>,
) -> ScanParameters2D {
    let (dx, dy) = corr_info.evaluate(now, params.length_unit);
    ScanParameters2D {
        top_left_x: params.top_left_x - dx,
        top_left_y: params.top_left_y - dy,
        ..params
    }
}
