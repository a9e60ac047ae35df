//! C10: the wrapping scheduler itself.
//!
//! One deliberate design choice, recorded in `DESIGN.md`: [`DriftScheduler`]
//! subscribes to its own cache's downstream socket like any other consumer,
//! so every scan it analyzes has already passed through the registered
//! inverse-transform hook and is already in the sample frame. Candidate
//! matching (ROI intersection, spatial-resolution ratio) is scale-invariant
//! to this choice since both the new scan and cached history scans are
//! corrected the same way; only the registration oracle's pixel data is
//! frame-independent regardless. Consequently the "true scan region" the
//! rescan trigger compares is simply the corrected `Scan2D.params` as
//! received over that subscription — it has already had `CorrectionInfo`
//! applied, so no separate "uncorrected position + CorrectionInfo"
//! recomputation is needed.

use crate::drift::correction::{self, CandidateSelection, DriftOracle};
use crate::error::Result;
use crate::messages::{CorrectionInfo, DriftLogRow, ProbePosition, Scan2D, ScanParameters2D, Spec1D};
use crate::scheduler::Scheduler;
use crate::topics;
use crate::transport::control_router::RouterTransformHook;
use crate::transport::pubsub::{Publisher, Subscriber};
use crate::units::{convert_length, LengthUnit};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Construction-time configuration for a [`DriftScheduler`], mirroring the
/// `CSCorrectedScheduler` constructor defaults in the Python original.
#[derive(Debug, Clone)]
pub struct DriftSchedulerConfig {
    /// Scan channel to analyze for drift (case-insensitive substring match,
    /// matching `channel_id.upper() in proto.channel.upper()`).
    pub channel_id: String,
    /// Minimum ROI intersection ratio to accept a cached scan as a
    /// candidate match. Default `0.5`.
    pub min_intersection_ratio: f64,
    /// Minimum spatial-resolution ratio to accept a candidate match.
    /// Default `0.25`.
    pub min_spatial_res_ratio: f64,
    /// Maximum oracle fit score passed through to [`DriftOracle::
    /// estimate_drift`]; the oracle itself decides whether a fit this poor
    /// or worse is unacceptable. Default `0.5`.
    pub max_fit_score: f64,
    /// Weight given to a new snapshot-derived estimate vs. the
    /// rate-extrapolated prior estimate, in `(0, 1]`. Default `1.0` (no
    /// averaging).
    pub update_weight: f64,
    /// Below this true/expected ROI intersection ratio, trigger a rescan.
    /// Default `0.75`.
    pub rescan_intersection_ratio: f64,
    /// Which cached candidate to use when more than one matches. Default
    /// [`CandidateSelection::Oldest`].
    pub selection: CandidateSelection,
    /// Bound on the number of historical scans retained for candidate
    /// matching. Default `64`.
    pub history_capacity: usize,
}

impl Default for DriftSchedulerConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            min_intersection_ratio: 0.5,
            min_spatial_res_ratio: 0.25,
            max_fit_score: 0.5,
            update_weight: 1.0,
            rescan_intersection_ratio: 0.75,
            selection: CandidateSelection::Oldest,
            history_capacity: 64,
        }
    }
}

struct DriftCsvLog {
    writer: csv::Writer<std::fs::File>,
}

impl DriftCsvLog {
    fn open(path: &std::path::Path) -> Result<Self> {
        let write_header = !path.exists();
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer
                .write_record([
                    "datetime",
                    "filename",
                    "corr_offset_x",
                    "corr_offset_y",
                    "corr_offset_units",
                    "corr_rate_x",
                    "corr_rate_y",
                    "corr_rate_units",
                    "scan_matched",
                ])
                .map_err(|e| crate::error::SpmError::DriftLog(e.to_string()))?;
            writer.flush()?;
        }
        Ok(Self { writer })
    }

    fn append(&mut self, row: &DriftLogRow) -> Result<()> {
        self.writer
            .serialize(row)
            .map_err(|e| crate::error::SpmError::DriftLog(e.to_string()))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// C10: wraps a [`Scheduler`] with coordinate-system drift correction.
pub struct DriftScheduler {
    scheduler: Scheduler,
    own_publisher: Publisher,
    corr_info: Arc<StdMutex<Option<CorrectionInfo>>>,
}

#[allow(clippy::too_many_arguments)]
impl DriftScheduler {
    /// Bind a drift-corrected scheduler: a [`Scheduler`] (C9) as in
    /// [`Scheduler::bind`], plus a dedicated publisher at
    /// `rescan_publisher_addr` for rescan requests, a drift `oracle`, and a
    /// CSV log at `csv_path` (appended to, header written only if the file
    /// did not already exist).
    pub async fn bind(
        cache_upstream_addr: impl Into<String>,
        cache_downstream_addr: impl Into<String>,
        cache_capacity: crate::transport::cache::CacheCapacity,
        router_addr: impl Into<String>,
        router_upstream_addr: impl Into<String>,
        rescan_publisher_addr: impl Into<String>,
        oracle: Arc<dyn DriftOracle>,
        csv_path: impl Into<PathBuf>,
        config: DriftSchedulerConfig,
    ) -> Result<Self> {
        let cache_downstream_addr = cache_downstream_addr.into();
        let scheduler = Scheduler::bind(
            cache_upstream_addr.into(),
            cache_downstream_addr.clone(),
            cache_capacity,
            router_addr.into(),
            router_upstream_addr.into(),
        )
        .await?;

        let corr_info: Arc<StdMutex<Option<CorrectionInfo>>> = Arc::new(StdMutex::new(None));

        let router_corr = corr_info.clone();
        let forward_hook: RouterTransformHook = Arc::new(move |params: ScanParameters2D| {
            let now = chrono::Utc::now();
            match router_corr.lock().unwrap().as_ref() {
                Some(info) => correction::apply_forward_scan_params(info, params, now),
                None => params,
            }
        });
        scheduler.router().set_transform(Some(forward_hook)).await;

        let cache_corr = corr_info.clone();
        let inverse_hook: crate::transport::cache::TransformHook =
            Arc::new(move |topic: &str, bytes: Vec<u8>| {
                let guard = cache_corr.lock().unwrap();
                let info = match guard.as_ref() {
                    Some(info) => *info,
                    None => return bytes,
                };
                drop(guard);
                apply_inverse_to_envelope(topic, bytes, &info)
            });
        scheduler.cache().set_transform(Some(inverse_hook)).await;

        let own_publisher = Publisher::bind(rescan_publisher_addr.into()).await?;
        let rescan_publisher = own_publisher.clone();

        let router_handle = scheduler.router().clone();
        let csv_log = DriftCsvLog::open(&csv_path.into())?;
        let task_corr = corr_info.clone();
        tokio::spawn(run_drift_loop(
            cache_downstream_addr,
            config,
            oracle,
            router_handle,
            rescan_publisher,
            task_corr,
            csv_log,
        ));

        Ok(Self { scheduler, own_publisher, corr_info })
    }

    /// The current cumulative correction estimate, if any snapshot has been
    /// observed yet.
    pub fn correction_info(&self) -> Option<CorrectionInfo> {
        *self.corr_info.lock().unwrap()
    }

    /// Drive the wrapped scheduler's `tick`; on shutdown, additionally
    /// signal this scheduler's own rescan publisher's subscribers to stop.
    pub async fn tick(&mut self) -> Result<bool> {
        let shutting_down = self.scheduler.tick().await?;
        if shutting_down {
            self.own_publisher.send_kill_signal()?;
        }
        Ok(shutting_down)
    }

    /// Drive [`DriftScheduler::tick`] in a loop until shutdown is observed.
    pub async fn run(&mut self, period: Duration) -> Result<()> {
        loop {
            if self.tick().await? {
                return Ok(());
            }
            tokio::time::sleep(period).await;
        }
    }
}

fn apply_inverse_to_envelope(topic: &str, bytes: Vec<u8>, info: &CorrectionInfo) -> Vec<u8> {
    let now = chrono::Utc::now();
    if topic == topics::SCAN_PARAMS {
        if let Ok(params) = bincode::deserialize::<ScanParameters2D>(&bytes) {
            let transformed = correction::apply_inverse_scan_params(info, params, now);
            if let Ok(encoded) = bincode::serialize(&transformed) {
                return encoded;
            }
        }
    } else if topic == topics::PROBE_POSITION {
        if let Ok(pos) = bincode::deserialize::<ProbePosition>(&bytes) {
            let transformed = info.apply_inverse(pos, now);
            if let Ok(encoded) = bincode::serialize(&transformed) {
                return encoded;
            }
        }
    } else if topic.starts_with(topics::SCAN2D) {
        if let Ok(mut scan) = bincode::deserialize::<Scan2D>(&bytes) {
            scan.params = correction::apply_inverse_scan_params(info, scan.params, scan.timestamp);
            if let Ok(encoded) = bincode::serialize(&scan) {
                return encoded;
            }
        }
    } else if topic == topics::SPEC1D {
        if let Ok(mut spec) = bincode::deserialize::<Spec1D>(&bytes) {
            spec.position = info.apply_inverse(spec.position, spec.timestamp);
            if let Ok(encoded) = bincode::serialize(&spec) {
                return encoded;
            }
        }
    }
    bytes
}

#[allow(clippy::too_many_arguments)]
async fn run_drift_loop(
    cache_downstream_addr: String,
    config: DriftSchedulerConfig,
    oracle: Arc<dyn DriftOracle>,
    router: crate::transport::control_router::ControlRouter,
    rescan_publisher: Publisher,
    corr_info: Arc<StdMutex<Option<CorrectionInfo>>>,
    mut csv_log: DriftCsvLog,
) {
    let mut subscriber = match Subscriber::connect(cache_downstream_addr.as_str(), &[topics::SCAN2D.to_string()]).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "drift scheduler failed to subscribe to its own cache");
            return;
        }
    };

    let channel_id_upper = config.channel_id.to_uppercase();
    let mut history: Vec<Scan2D> = Vec::new();

    loop {
        let envelope = match subscriber.recv::<Scan2D>().await {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "drift scheduler lost its scan subscription");
                return;
            }
        };
        if Subscriber::is_kill_topic(&envelope.topic) {
            return;
        }
        let scan = envelope.payload;
        if !channel_id_upper.is_empty() && !scan.channel.to_uppercase().contains(channel_id_upper.as_str()) {
            continue;
        }

        let matched = correction::find_matching_scan(
            &history,
            &scan,
            config.min_intersection_ratio,
            config.min_spatial_res_ratio,
            config.selection,
        );

        let snapshot = match matched {
            Some(candidate) => {
                match oracle.estimate_drift(candidate, &scan, config.max_fit_score).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        tracing::warn!(error = %err, "drift oracle failed");
                        None
                    }
                }
            }
            None => None,
        };
        let scan_matched = snapshot.is_some();

        if let Some(snapshot) = &snapshot {
            let mut guard = corr_info.lock().unwrap();
            match guard.as_mut() {
                Some(info) => info.blend(snapshot, config.update_weight, scan.params.length_unit),
                None => {
                    *guard = Some(CorrectionInfo {
                        timestamp: snapshot.timestamp,
                        offset_x: convert_length(snapshot.offset_x, snapshot.length_unit, LengthUnit::Meter),
                        offset_y: convert_length(snapshot.offset_y, snapshot.length_unit, LengthUnit::Meter),
                        rate_x: 0.0,
                        rate_y: 0.0,
                    });
                }
            }
        }
        let current_corr_info = *corr_info.lock().unwrap();

        if let Some(expected) = router.last_scan_params().await {
            let ratio = correction::roi_intersection_ratio(&scan.params, &expected);
            if ratio < config.rescan_intersection_ratio {
                tracing::warn!(ratio, "true scan region drifted too far from expected, requesting rescan");
                if let Err(err) = rescan_publisher.publish(topics::RESCAN_REQUEST, &expected) {
                    tracing::warn!(error = %err, "failed to publish rescan request");
                }
            }
        }

        let row = build_log_row(&scan, current_corr_info, scan_matched);
        if let Err(err) = csv_log.append(&row) {
            tracing::warn!(error = %err, "failed to append drift log row");
        }

        history.push(scan);
        if history.len() > config.history_capacity {
            history.remove(0);
        }
    }
}

fn build_log_row(scan: &Scan2D, corr_info: Option<CorrectionInfo>, scan_matched: bool) -> DriftLogRow {
    match corr_info {
        Some(info) => {
            let (x, y) = info.evaluate(scan.timestamp, scan.params.length_unit);
            DriftLogRow {
                datetime: scan.timestamp,
                filename: scan.channel.clone(),
                corr_offset_x: Some(x),
                corr_offset_y: Some(y),
                corr_offset_units: Some(scan.params.length_unit),
                corr_rate_x: Some(convert_length(info.rate_x, LengthUnit::Meter, scan.params.length_unit)),
                corr_rate_y: Some(convert_length(info.rate_y, LengthUnit::Meter, scan.params.length_unit)),
                corr_rate_units: Some(scan.params.length_unit),
                scan_matched,
            }
        }
        None => DriftLogRow {
            datetime: scan.timestamp,
            filename: scan.channel.clone(),
            corr_offset_x: None,
            corr_offset_y: None,
            corr_offset_units: None,
            corr_rate_x: None,
            corr_rate_y: None,
            corr_rate_units: None,
            scan_matched,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DriftSnapshot;
    use crate::units::{AngleUnit, LengthUnit};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn scan_params(top_left_x: f64, top_left_y: f64) -> ScanParameters2D {
        ScanParameters2D {
            top_left_x,
            top_left_y,
            size_x: 10.0,
            size_y: 10.0,
            length_unit: LengthUnit::Nanometer,
            data_shape_x: 256,
            data_shape_y: 256,
            angle: 0.0,
            angle_unit: AngleUnit::Degree,
        }
    }

    fn scan_at(timestamp: chrono::DateTime<chrono::Utc>, top_left_x: f64) -> Scan2D {
        Scan2D {
            data: vec![],
            width: 256,
            height: 256,
            params: scan_params(top_left_x, 0.0),
            timestamp,
            channel: "height".to_string(),
        }
    }

    struct ScriptedOracle {
        snapshot: Mutex<Option<DriftSnapshot>>,
    }

    #[async_trait]
    impl DriftOracle for ScriptedOracle {
        async fn estimate_drift(
            &self,
            _scan_a: &Scan2D,
            _scan_b: &Scan2D,
            _max_fit_score: f64,
        ) -> Result<Option<DriftSnapshot>> {
            Ok(*self.snapshot.lock().unwrap())
        }
    }

    #[test]
    fn csv_log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.csv");
        {
            let mut log = DriftCsvLog::open(&path).unwrap();
            log.append(&build_log_row(&scan_at(chrono::Utc::now(), 0.0), None, false)).unwrap();
        }
        {
            let mut log = DriftCsvLog::open(&path).unwrap();
            log.append(&build_log_row(&scan_at(chrono::Utc::now(), 0.0), None, true)).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("datetime").count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn unrecognized_topic_passes_through_unchanged() {
        let info = CorrectionInfo {
            timestamp: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            offset_x: 1e-9,
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let bytes = vec![1, 2, 3];
        let out = apply_inverse_to_envelope("control_state", bytes.clone(), &info);
        assert_eq!(out, bytes);
    }

    #[test]
    fn scan_params_topic_is_inverse_corrected() {
        let info = CorrectionInfo {
            timestamp: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            offset_x: crate::units::convert_length(1.0, LengthUnit::Nanometer, LengthUnit::Meter),
            offset_y: 0.0,
            rate_x: 0.0,
            rate_y: 0.0,
        };
        let params = scan_params(5.0, 0.0);
        let bytes = bincode::serialize(&params).unwrap();
        let out = apply_inverse_to_envelope(topics::SCAN_PARAMS, bytes, &info);
        let decoded: ScanParameters2D = bincode::deserialize(&out).unwrap();
        assert!((decoded.top_left_x - 4.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn oracle_snapshot_initializes_correction_info() {
        let corr_info: Arc<StdMutex<Option<CorrectionInfo>>> = Arc::new(StdMutex::new(None));
        let snapshot = DriftSnapshot {
            offset_x: 2.0,
            offset_y: 0.0,
            length_unit: LengthUnit::Nanometer,
            fit_score: 0.9,
            timestamp: chrono::Utc::now(),
        };
        {
            let mut guard = corr_info.lock().unwrap();
            *guard = Some(CorrectionInfo {
                timestamp: snapshot.timestamp,
                offset_x: convert_length(snapshot.offset_x, snapshot.length_unit, LengthUnit::Meter),
                offset_y: 0.0,
                rate_x: 0.0,
                rate_y: 0.0,
            });
        }
        let stored = corr_info.lock().unwrap().unwrap();
        assert!((convert_length(stored.offset_x, LengthUnit::Meter, LengthUnit::Nanometer) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn scripted_oracle_returns_configured_snapshot() {
        let oracle = ScriptedOracle { snapshot: Mutex::new(None) };
        assert!(oracle.snapshot.lock().unwrap().is_none());
    }
}
