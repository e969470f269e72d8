//! Image pull progress aggregation
//!
//! `docker pull` reports progress per layer, either as line-delimited JSON
//! records or as human-readable text, and the detail it gives varies wildly
//! between layers: some report byte counts for both download and extraction,
//! some report nothing at all (cache hits finish instantly). This module turns
//! that stream into a single completion percentage plus a status line and
//! pushes both to registered observers.
//!
//! Every input line is classified once into a [`PullLine`] and then applied to
//! the per-layer state map.

use crate::errors::DockerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, trace, warn};

/// Percentage value meaning "status text only, leave the percentage alone"
pub const STATUS_ONLY: f64 = -1.0;

/// Length of the abbreviated layer id docker prints in text mode
const LAYER_ID_LEN: usize = 12;

/// Share of a layer's weight given to the download phase
const DOWNLOAD_WEIGHT: f64 = 60.0;
/// Share of a layer's weight given to the extraction phase
const EXTRACT_WEIGHT: f64 = 40.0;
/// Byte-based scoring kicks in when more than this fraction of work layers report bytes
const BYTE_MODE_LAYER_FRACTION: f64 = 0.3;
/// Lines of pull output kept per stream for error reports
pub const TRANSCRIPT_TAIL: usize = 20;

static SIZE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([kKmMgGtT]?B)/(\d+(?:\.\d+)?)\s*([kKmMgGtT]?B)")
        .expect("valid size pattern")
});

/// Progress state of one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    Preparing,
    Waiting,
    Downloading,
    Extracting,
    DownloadComplete,
    PullComplete,
    AlreadyExists,
    /// Any other status docker reports (e.g. "Verifying Checksum")
    Other(String),
}

impl LayerStatus {
    /// Map a docker status string onto a layer status
    pub fn from_docker(status: &str) -> Self {
        match status.trim() {
            "Pulling fs layer" | "Preparing" => Self::Preparing,
            "Waiting" => Self::Waiting,
            "Downloading" => Self::Downloading,
            "Extracting" => Self::Extracting,
            "Download complete" => Self::DownloadComplete,
            "Pull complete" => Self::PullComplete,
            "Already exists" => Self::AlreadyExists,
            other => Self::Other(other.to_string()),
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self, Self::PullComplete | Self::DownloadComplete)
    }

    fn is_cached(&self) -> bool {
        matches!(self, Self::AlreadyExists)
    }
}

/// Per-layer progress counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerProgress {
    pub id: String,
    pub status: LayerStatus,
    pub download_current: u64,
    pub download_total: u64,
    pub extract_current: u64,
    pub extract_total: u64,
}

impl LayerProgress {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: LayerStatus::Preparing,
            download_current: 0,
            download_total: 0,
            extract_current: 0,
            extract_total: 0,
        }
    }

    fn has_meaningful_download(&self) -> bool {
        self.download_total > 1
    }

    fn has_meaningful_extract(&self) -> bool {
        self.extract_total > 1
    }

    fn record(&mut self, phase: Phase, current: u64, total: u64) {
        let (cur, tot) = match phase {
            Phase::Download => (&mut self.download_current, &mut self.download_total),
            Phase::Extract => (&mut self.extract_current, &mut self.extract_total),
        };
        // A meaningful total is authoritative; placeholder totals may be replaced
        if total > 1 || *tot <= 1 {
            *tot = total.max(*tot);
        }
        *cur = current.min(*tot);
    }

    fn fill_download(&mut self) {
        if self.download_total == 0 {
            self.download_total = 1;
        }
        self.download_current = self.download_total;
    }

    fn fill_extract(&mut self) {
        if self.extract_total == 0 {
            self.extract_total = 1;
        }
        self.extract_current = self.extract_total;
    }
}

/// Download or extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Extract,
}

/// `progressDetail` of a structured pull record
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
}

/// One structured record of `docker pull` JSON output
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PullRecord {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub progress: String,
    #[serde(default, rename = "progressDetail")]
    pub progress_detail: ProgressDetail,
    #[serde(default)]
    pub error: String,
}

/// Known free-form phrases attached to a layer id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPhrase {
    PullingFsLayer,
    Waiting,
    AlreadyExists,
    PullComplete,
    DownloadComplete,
    /// "Downloading"/"Extracting" without a parsable size
    Active(Phase),
}

/// Classification of a single line of pull output
#[derive(Debug, Clone, PartialEq)]
pub enum PullLine {
    /// Empty or whitespace-only
    Blank,
    /// Structured JSON record
    Record(PullRecord),
    /// Image-level status text (`Status: ...`)
    Status(String),
    /// `<tag>: Pulling from <repo>`
    Started,
    /// Layer line with a recognised phrase
    Phrase { layer: String, phrase: LayerPhrase },
    /// Layer line carrying `<n><unit>/<n><unit>` byte counts
    Sized {
        layer: String,
        phase: Phase,
        current: u64,
        total: u64,
    },
    /// Layer line with text we do not understand
    UnknownLayerLine { layer: String, text: String },
    /// Line without a layer id that matched nothing else
    Unrecognized(String),
}

impl PullLine {
    /// Decide once what a line of pull output is
    pub fn classify(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Blank;
        }

        if trimmed.starts_with('{') {
            if let Ok(record) = serde_json::from_str::<PullRecord>(trimmed) {
                // The tag line carries the tag in `id`; it is not a layer
                if record.error.is_empty() && record.status.starts_with("Pulling from") {
                    return Self::Started;
                }
                return Self::Record(record);
            }
        }

        let (layer, rest) = split_layer_prefix(trimmed);

        if let Some(status) = rest.strip_prefix("Status:") {
            return Self::Status(status.trim().to_string());
        }
        if rest.contains("Pulling from") {
            return Self::Started;
        }

        let Some(layer) = layer else {
            return Self::Unrecognized(trimmed.to_string());
        };
        let layer = layer.to_string();

        let phrase = if rest.contains("Pulling fs layer") {
            Some(LayerPhrase::PullingFsLayer)
        } else if rest.contains("Waiting") {
            Some(LayerPhrase::Waiting)
        } else if rest.contains("Already exists") {
            Some(LayerPhrase::AlreadyExists)
        } else if rest.contains("Pull complete") {
            Some(LayerPhrase::PullComplete)
        } else if rest.contains("Download complete") {
            Some(LayerPhrase::DownloadComplete)
        } else {
            None
        };
        if let Some(phrase) = phrase {
            return Self::Phrase { layer, phrase };
        }

        let phase = if rest.contains("Extracting") {
            Some(Phase::Extract)
        } else if rest.contains("Downloading") {
            Some(Phase::Download)
        } else {
            None
        };

        match phase {
            Some(phase) => match parse_size_pair(rest) {
                Some((current, total)) => Self::Sized {
                    layer,
                    phase,
                    current,
                    total,
                },
                None => Self::Phrase {
                    layer,
                    phrase: LayerPhrase::Active(phase),
                },
            },
            None => Self::UnknownLayerLine {
                layer,
                text: rest.to_string(),
            },
        }
    }
}

/// Split `"<12-char id>: rest"` into its parts
fn split_layer_prefix(line: &str) -> (Option<&str>, &str) {
    if let Some((prefix, rest)) = line.split_once(':') {
        if prefix.len() == LAYER_ID_LEN && prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return (Some(prefix), rest.trim());
        }
    }
    (None, line)
}

/// Convert a size with a K/M/G/T suffix to bytes (1024 multiplier)
pub fn parse_size(value: &str, unit: &str) -> u64 {
    let multiplier: f64 = match unit.to_ascii_uppercase().as_str() {
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    let number: f64 = value.parse().unwrap_or(0.0);
    (number * multiplier) as u64
}

fn parse_size_pair(text: &str) -> Option<(u64, u64)> {
    let caps = SIZE_PATTERN.captures(text)?;
    Some((
        parse_size(&caps[1], &caps[2]),
        parse_size(&caps[3], &caps[4]),
    ))
}

/// Percentage plus status line derived from the layer map
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// 0..=100, or [`STATUS_ONLY`]
    pub percentage: f64,
    pub status: String,
}

impl ProgressSnapshot {
    pub fn is_status_only(&self) -> bool {
        self.percentage < 0.0
    }
}

type Callback = Arc<dyn Fn(f64, &str) + Send + Sync>;

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// Registry of progress observers.
///
/// Cheap to clone; clones share the same registry. Observers are revoked by
/// dropping the [`Subscription`] returned from [`ProgressObservers::subscribe`].
#[derive(Clone, Default)]
pub struct ProgressObservers {
    inner: Arc<Mutex<ObserverList>>,
}

impl std::fmt::Debug for ProgressObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressObservers")
            .field("observers", &self.len())
            .finish()
    }
}

impl ProgressObservers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ObserverList> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a callback receiving `(percentage, status)`.
    ///
    /// `percentage == -1.0` means only the status text changed. Callbacks may
    /// see the same values more than once.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        let mut list = self.lock();
        list.next_id += 1;
        let id = list.next_id;
        list.callbacks.push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live observers
    pub fn len(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a notification to every live observer
    pub fn notify(&self, percentage: f64, status: &str) {
        // Snapshot so callbacks can subscribe/unsubscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(percentage, status);
        }
    }
}

/// Revocable registration of a progress observer; dropping it unsubscribes
#[must_use = "dropping a Subscription immediately unsubscribes the observer"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<ObserverList>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut list = registry.lock().unwrap_or_else(|p| p.into_inner());
            list.callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Debug, Default)]
struct PullState {
    layers: HashMap<String, LayerProgress>,
    high_water: f64,
}

/// Aggregated progress of one pull run
#[derive(Debug)]
pub struct PullProgress {
    state: Mutex<PullState>,
    observers: ProgressObservers,
}

impl Default for PullProgress {
    fn default() -> Self {
        Self::new(ProgressObservers::new())
    }
}

impl PullProgress {
    /// Create a tracker that reports to `observers`
    pub fn new(observers: ProgressObservers) -> Self {
        Self {
            state: Mutex::new(PullState::default()),
            observers,
        }
    }

    pub fn observers(&self) -> &ProgressObservers {
        &self.observers
    }

    fn lock(&self) -> MutexGuard<'_, PullState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Copy of the current layer map
    pub fn layers(&self) -> HashMap<String, LayerProgress> {
        self.lock().layers.clone()
    }

    /// Current aggregate without notifying anyone
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        ProgressSnapshot {
            percentage: calculate_percentage(&state.layers).max(state.high_water),
            status: overall_status(&state.layers),
        }
    }

    /// Drain a reader line by line, applying each line.
    ///
    /// Structured records carrying an `error` are logged and skipped; only a
    /// failure to read the stream itself is returned. On success the last
    /// [`TRANSCRIPT_TAIL`] non-empty lines are returned for diagnostics.
    pub async fn process_stream<R>(&self, reader: R) -> Result<String, DockerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TRANSCRIPT_TAIL);
        let mut segments = BufReader::new(reader).split(b'\n');
        while let Some(segment) = segments.next_segment().await.map_err(|e| {
            DockerError::Stream {
                message: format!("error reading pull output: {}", e),
            }
        })? {
            let line = String::from_utf8_lossy(&segment);
            if let Err(e) = self.process_line(&line) {
                warn!("Pull stream warning: {}", e);
            }
            let line = line.trim_end();
            if !line.is_empty() {
                if tail.len() == TRANSCRIPT_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }
        Ok(Vec::from(tail).join("\n"))
    }

    /// Apply a single line of pull output and notify observers.
    ///
    /// Returns the snapshot that was delivered, if any.
    pub fn process_line(&self, line: &str) -> Result<Option<ProgressSnapshot>, DockerError> {
        let classified = PullLine::classify(line);
        trace!("Pull line {:?}", classified);

        // Observers are notified under the state lock so that deliveries from
        // the stdout and stderr workers stay in computation order.
        let mut state = self.lock();

        let (layer_id, update) = match classified {
            PullLine::Blank => return Ok(None),
            PullLine::Status(text) => {
                return Ok(Some(self.emit_status_only(text)));
            }
            PullLine::Started => {
                let snapshot = ProgressSnapshot {
                    percentage: state.high_water,
                    status: "Starting download...".to_string(),
                };
                self.observers.notify(snapshot.percentage, &snapshot.status);
                return Ok(Some(snapshot));
            }
            PullLine::Unrecognized(text) => {
                debug!("Non-layer pull output: {}", text);
                return Ok(Some(self.emit_status_only(text)));
            }
            PullLine::Record(record) => {
                if !record.error.is_empty() {
                    return Err(DockerError::Stream {
                        message: format!("docker error: {}", record.error),
                    });
                }
                if record.id.is_empty() {
                    debug!("Docker status: {}", record.status);
                    return Ok(Some(self.emit_status_only(record.status)));
                }
                (record.id.clone(), LayerUpdate::Record(record))
            }
            PullLine::Phrase { layer, phrase } => (layer, LayerUpdate::Phrase(phrase)),
            PullLine::Sized {
                layer,
                phase,
                current,
                total,
            } => (
                layer,
                LayerUpdate::Sized {
                    phase,
                    current,
                    total,
                },
            ),
            PullLine::UnknownLayerLine { layer, text } => {
                trace!("Unhandled layer text for {}: {}", layer, text);
                (layer, LayerUpdate::Register)
            }
        };

        let layer = state
            .layers
            .entry(layer_id.clone())
            .or_insert_with(|| LayerProgress::new(&layer_id));
        update.apply(layer);

        let computed = calculate_percentage(&state.layers);
        if computed < state.high_water {
            trace!(
                "Holding progress at {:.1}% (computed {:.1}%)",
                state.high_water,
                computed
            );
        }
        state.high_water = state.high_water.max(computed);

        let snapshot = ProgressSnapshot {
            percentage: state.high_water,
            status: overall_status(&state.layers),
        };
        self.observers.notify(snapshot.percentage, &snapshot.status);
        Ok(Some(snapshot))
    }

    fn emit_status_only(&self, text: String) -> ProgressSnapshot {
        let snapshot = ProgressSnapshot {
            percentage: STATUS_ONLY,
            status: text,
        };
        self.observers.notify(STATUS_ONLY, &snapshot.status);
        snapshot
    }
}

/// Change to a single layer derived from one classified line
enum LayerUpdate {
    Record(PullRecord),
    Phrase(LayerPhrase),
    Sized { phase: Phase, current: u64, total: u64 },
    /// Only make sure the layer is tracked
    Register,
}

impl LayerUpdate {
    fn apply(self, layer: &mut LayerProgress) {
        match self {
            Self::Record(record) => apply_record(layer, &record),
            Self::Phrase(phrase) => apply_phrase(layer, phrase),
            Self::Sized {
                phase,
                current,
                total,
            } => {
                layer.status = match phase {
                    Phase::Download => LayerStatus::Downloading,
                    Phase::Extract => LayerStatus::Extracting,
                };
                layer.record(phase, current, total);
            }
            Self::Register => {}
        }
    }
}

fn apply_record(layer: &mut LayerProgress, record: &PullRecord) {
    let status = LayerStatus::from_docker(&record.status);
    let detail = &record.progress_detail;
    match status {
        LayerStatus::Downloading if detail.total > 0 => {
            layer.record(Phase::Download, detail.current, detail.total)
        }
        LayerStatus::Extracting if detail.total > 0 => {
            layer.record(Phase::Extract, detail.current, detail.total)
        }
        LayerStatus::DownloadComplete => layer.download_current = layer.download_total,
        LayerStatus::PullComplete | LayerStatus::AlreadyExists => {
            layer.download_current = layer.download_total;
            layer.extract_current = layer.extract_total;
        }
        _ => {}
    }
    layer.status = status;
}

fn apply_phrase(layer: &mut LayerProgress, phrase: LayerPhrase) {
    match phrase {
        LayerPhrase::PullingFsLayer => layer.status = LayerStatus::Preparing,
        LayerPhrase::Waiting => layer.status = LayerStatus::Waiting,
        LayerPhrase::AlreadyExists => {
            layer.status = LayerStatus::AlreadyExists;
            layer.fill_download();
            layer.fill_extract();
        }
        LayerPhrase::PullComplete => {
            layer.status = LayerStatus::PullComplete;
            layer.fill_download();
            layer.fill_extract();
        }
        LayerPhrase::DownloadComplete => {
            layer.status = LayerStatus::DownloadComplete;
            layer.download_current = layer.download_total;
        }
        LayerPhrase::Active(Phase::Download) => layer.status = LayerStatus::Downloading,
        LayerPhrase::Active(Phase::Extract) => layer.status = LayerStatus::Extracting,
    }
}

/// Overall completion percentage for a layer map, clamped to `0..=100`
pub fn calculate_percentage(layers: &HashMap<String, LayerProgress>) -> f64 {
    if layers.is_empty() {
        return 0.0;
    }

    let total_layers = layers.len();
    let mut cached = 0usize;
    let mut completed = 0usize;
    let mut with_bytes = 0usize;
    let (mut dl_current, mut dl_total) = (0u64, 0u64);
    let (mut ex_current, mut ex_total) = (0u64, 0u64);

    for layer in layers.values() {
        if layer.status.is_cached() {
            cached += 1;
            continue;
        }
        if layer.status.is_complete() {
            completed += 1;
        }

        let meaningful_download = layer.has_meaningful_download();
        let meaningful_extract = layer.has_meaningful_extract();
        if meaningful_download {
            dl_total += layer.download_total;
            dl_current += layer.download_current;
        }
        if meaningful_extract {
            ex_total += layer.extract_total;
            ex_current += layer.extract_current;
        }
        if meaningful_download || meaningful_extract {
            with_bytes += 1;
        }
    }

    if cached == total_layers || completed + cached == total_layers {
        return 100.0;
    }

    let work_layers = total_layers - cached;
    let use_bytes = (dl_total > 0 || ex_total > 0)
        && (with_bytes >= 2
            || with_bytes as f64 / work_layers as f64 > BYTE_MODE_LAYER_FRACTION);

    if !use_bytes {
        let progress = completed as f64 / work_layers as f64 * 100.0;
        trace!(
            "Layer-based progress: {}/{} work layers complete = {:.1}%",
            completed,
            work_layers,
            progress
        );
        return progress.clamp(0.0, 100.0);
    }

    let mut progress = 0.0;
    if dl_total > 0 {
        progress += dl_current as f64 / dl_total as f64 * DOWNLOAD_WEIGHT;
    }
    if ex_total > 0 {
        progress += ex_current as f64 / ex_total as f64 * EXTRACT_WEIGHT;
    }

    // Blend in layers that never reported byte counts
    if with_bytes < work_layers {
        let without_bytes = work_layers - with_bytes;
        let completed_without_bytes = layers
            .values()
            .filter(|l| {
                l.status.is_complete()
                    && !l.has_meaningful_download()
                    && !l.has_meaningful_extract()
            })
            .count();
        let count_progress = completed_without_bytes as f64 / without_bytes as f64 * 100.0;
        let byte_weight = with_bytes as f64 / work_layers as f64;
        let count_weight = without_bytes as f64 / work_layers as f64;
        progress = progress * byte_weight + count_progress * count_weight;
    }

    trace!(
        "Byte-based progress: download {}/{} extract {}/{} -> {:.1}%",
        dl_current,
        dl_total,
        ex_current,
        ex_total,
        progress
    );
    progress.clamp(0.0, 100.0)
}

/// Human-readable status line for a layer map
pub fn overall_status(layers: &HashMap<String, LayerProgress>) -> String {
    let mut downloading = 0usize;
    let mut extracting = 0usize;
    let mut complete = 0usize;
    let mut cached = 0usize;
    let mut preparing = 0usize;

    for layer in layers.values() {
        match layer.status {
            LayerStatus::Downloading => downloading += 1,
            LayerStatus::Extracting => extracting += 1,
            LayerStatus::PullComplete | LayerStatus::DownloadComplete => complete += 1,
            LayerStatus::AlreadyExists => cached += 1,
            LayerStatus::Preparing | LayerStatus::Waiting => preparing += 1,
            LayerStatus::Other(_) => {}
        }
    }

    let total = layers.len();
    let work = total - cached;

    if total > 0 && cached == total {
        return "Image already available".to_string();
    }
    if downloading > 0 {
        return format!("Downloading layers ({}/{} completed)", complete, work);
    }
    if extracting > 0 {
        return format!("Extracting layers ({}/{} completed)", complete, work);
    }
    if work > 0 && complete == work {
        return "Pull complete".to_string();
    }
    if preparing > 0 {
        return "Initializing download...".to_string();
    }
    "Starting download...".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressObservers, Arc<Mutex<Vec<(f64, String)>>>, Subscription) {
        let observers = ProgressObservers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = observers.subscribe(move |p, s| sink.lock().unwrap().push((p, s.to_string())));
        (observers, seen, sub)
    }

    #[test]
    fn test_classify_structured_record() {
        let line = r#"{"status":"Downloading","progressDetail":{"current":10,"total":100},"id":"4f4fb700ef54"}"#;
        match PullLine::classify(line) {
            PullLine::Record(record) => {
                assert_eq!(record.id, "4f4fb700ef54");
                assert_eq!(record.progress_detail.total, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_free_form_lines() {
        assert_eq!(PullLine::classify("   "), PullLine::Blank);
        assert_eq!(
            PullLine::classify("latest: Pulling from library/moodle"),
            PullLine::Started
        );
        assert_eq!(
            PullLine::classify("Status: Downloaded newer image for moodle:latest"),
            PullLine::Status("Downloaded newer image for moodle:latest".to_string())
        );
        assert_eq!(
            PullLine::classify("4f4fb700ef54: Pulling fs layer"),
            PullLine::Phrase {
                layer: "4f4fb700ef54".to_string(),
                phrase: LayerPhrase::PullingFsLayer
            }
        );
        assert_eq!(
            PullLine::classify("8cc6894b165e: Downloading [==>    ]  12.5MB/50MB"),
            PullLine::Sized {
                layer: "8cc6894b165e".to_string(),
                phase: Phase::Download,
                current: 12 * 1024 * 1024 + 512 * 1024,
                total: 50 * 1024 * 1024,
            }
        );
        assert_eq!(
            PullLine::classify("8cc6894b165e: Extracting  512B/2kB"),
            PullLine::Sized {
                layer: "8cc6894b165e".to_string(),
                phase: Phase::Extract,
                current: 512,
                total: 2048,
            }
        );
        assert_eq!(
            PullLine::classify("8cc6894b165e: Verifying Checksum"),
            PullLine::UnknownLayerLine {
                layer: "8cc6894b165e".to_string(),
                text: "Verifying Checksum".to_string()
            }
        );
        assert!(matches!(
            PullLine::classify("Digest: sha256:abcdef"),
            PullLine::Unrecognized(_)
        ));
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1", "KB"), 1024);
        assert_eq!(parse_size("1.5", "MB"), 1_572_864);
        assert_eq!(parse_size("2", "GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1", "TB"), 1024u64.pow(4));
        assert_eq!(parse_size("300", "B"), 300);
        assert_eq!(parse_size("garbage", "MB"), 0);
    }

    #[test]
    fn test_all_layers_cached_is_complete() {
        let progress = PullProgress::default();
        for id in ["aaaaaaaaaaaa", "bbbbbbbbbbbb", "cccccccccccc"] {
            progress
                .process_line(&format!("{}: Already exists", id))
                .unwrap();
        }
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.percentage, 100.0);
        assert_eq!(snapshot.status, "Image already available");
    }

    #[test]
    fn test_count_based_progress_without_bytes() {
        let progress = PullProgress::default();
        progress.process_line("aaaaaaaaaaaa: Pulling fs layer").unwrap();
        progress.process_line("bbbbbbbbbbbb: Pulling fs layer").unwrap();
        progress.process_line("cccccccccccc: Already exists").unwrap();
        progress.process_line("dddddddddddd: Pulling fs layer").unwrap();
        progress.process_line("eeeeeeeeeeee: Pulling fs layer").unwrap();
        let snapshot = progress.process_line("aaaaaaaaaaaa: Pull complete").unwrap().unwrap();
        // 1 of 4 work layers done, the cached layer is excluded
        assert_eq!(snapshot.percentage, 25.0);
        assert_eq!(snapshot.status, "Initializing download...");
    }

    #[test]
    fn test_byte_based_progress_weights_download_and_extract() {
        let mut layers = HashMap::new();
        for id in ["aaaaaaaaaaaa", "bbbbbbbbbbbb"] {
            let mut layer = LayerProgress::new(id);
            layer.status = LayerStatus::Downloading;
            layer.download_total = 100;
            layer.download_current = 50;
            layers.insert(id.to_string(), layer);
        }
        // 50% of the download phase is 30 points
        assert!((calculate_percentage(&layers) - 30.0).abs() < 1e-9);

        for layer in layers.values_mut() {
            layer.status = LayerStatus::Extracting;
            layer.download_current = 100;
            layer.extract_total = 100;
            layer.extract_current = 50;
        }
        assert!((calculate_percentage(&layers) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_progress_blends_byteless_layers() {
        let mut layers = HashMap::new();
        let mut a = LayerProgress::new("aaaaaaaaaaaa");
        a.status = LayerStatus::Downloading;
        a.download_total = 100;
        a.download_current = 100;
        layers.insert(a.id.clone(), a);

        let mut b = LayerProgress::new("bbbbbbbbbbbb");
        b.status = LayerStatus::PullComplete;
        b.download_total = 1;
        b.download_current = 1;
        layers.insert(b.id.clone(), b);

        let c = LayerProgress::new("cccccccccccc");
        layers.insert(c.id.clone(), c);

        // one of three layers has bytes (> 30%): byte part 60 weighted 1/3,
        // byte-less part 1/2 complete weighted 2/3
        let expected = 60.0 / 3.0 + 50.0 * 2.0 / 3.0;
        assert!((calculate_percentage(&layers) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_placeholder_totals_are_not_meaningful() {
        let mut layer = LayerProgress::new("aaaaaaaaaaaa");
        layer.record(Phase::Download, 1, 1);
        assert!(!layer.has_meaningful_download());
        layer.record(Phase::Download, 10, 200);
        assert_eq!(layer.download_total, 200);
        // A later smaller total does not override an authoritative one
        layer.record(Phase::Download, 20, 1);
        assert_eq!(layer.download_total, 200);
        assert_eq!(layer.download_current, 20);
    }

    #[test]
    fn test_increasing_current_never_lowers_percentage() {
        let progress = PullProgress::default();
        progress.process_line("aaaaaaaaaaaa: Pulling fs layer").unwrap();
        progress.process_line("bbbbbbbbbbbb: Pulling fs layer").unwrap();
        progress.process_line("cccccccccccc: Pulling fs layer").unwrap();
        progress
            .process_line("bbbbbbbbbbbb: Downloading  1MB/4MB")
            .unwrap();

        let mut last = 0.0;
        for mb in 1..=10 {
            let snapshot = progress
                .process_line(&format!("aaaaaaaaaaaa: Downloading  {}MB/10MB", mb))
                .unwrap()
                .unwrap();
            assert!(snapshot.percentage >= last);
            assert!(snapshot.percentage <= 100.0);
            last = snapshot.percentage;
        }
    }

    #[test]
    fn test_percentage_never_regresses_when_layers_appear_late() {
        let (observers, seen, _sub) = recorder();
        let progress = PullProgress::new(observers);
        progress.process_line("aaaaaaaaaaaa: Pulling fs layer").unwrap();
        progress.process_line("aaaaaaaaaaaa: Pull complete").unwrap();
        // A newly discovered layer would drop the raw count-based value to 50%
        progress.process_line("bbbbbbbbbbbb: Pulling fs layer").unwrap();
        progress.process_line("bbbbbbbbbbbb: Pull complete").unwrap();

        let percentages: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| *p)
            .filter(|p| *p >= 0.0)
            .collect();
        assert!(percentages.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*percentages.last().unwrap(), 100.0);
    }

    #[test]
    fn test_status_only_lines_use_sentinel() {
        let (observers, seen, _sub) = recorder();
        let progress = PullProgress::new(observers);
        let snapshot = progress
            .process_line("Status: Image is up to date for moodle:latest")
            .unwrap()
            .unwrap();
        assert!(snapshot.is_status_only());
        assert_eq!(
            seen.lock().unwrap()[0],
            (STATUS_ONLY, "Image is up to date for moodle:latest".to_string())
        );

        let snapshot = progress
            .process_line(r#"{"status":"Verifying image signature"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.percentage, STATUS_ONLY);

        let snapshot = progress
            .process_line(r#"{"status":"Pulling from library/moodle","id":"latest"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, "Starting download...");
        assert!(progress.layers().is_empty());
    }

    #[test]
    fn test_record_with_error_is_reported_without_state_change() {
        let progress = PullProgress::default();
        let err = progress
            .process_line(r#"{"error":"manifest unknown"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
        assert!(progress.layers().is_empty());
    }

    #[test]
    fn test_status_text_priority() {
        let progress = PullProgress::default();
        progress.process_line("aaaaaaaaaaaa: Pulling fs layer").unwrap();
        progress
            .process_line("bbbbbbbbbbbb: Extracting  1MB/2MB")
            .unwrap();
        assert_eq!(
            progress.snapshot().status,
            "Extracting layers (0/2 completed)"
        );
        progress
            .process_line("aaaaaaaaaaaa: Downloading  1MB/2MB")
            .unwrap();
        assert_eq!(
            progress.snapshot().status,
            "Downloading layers (0/2 completed)"
        );
        progress.process_line("aaaaaaaaaaaa: Pull complete").unwrap();
        progress.process_line("bbbbbbbbbbbb: Pull complete").unwrap();
        assert_eq!(progress.snapshot().status, "Pull complete");
        assert_eq!(progress.snapshot().percentage, 100.0);
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let (observers, seen, sub) = recorder();
        let progress = PullProgress::new(observers.clone());
        progress.process_line("aaaaaaaaaaaa: Pulling fs layer").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        sub.cancel();
        assert!(observers.is_empty());
        progress.process_line("aaaaaaaaaaaa: Pull complete").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_subscription_outliving_registry_is_harmless() {
        let observers = ProgressObservers::new();
        let sub = observers.subscribe(|_, _| {});
        drop(observers);
        drop(sub);
    }

    #[tokio::test]
    async fn test_process_stream_reads_all_lines() {
        let input = b"latest: Pulling from library/moodle\n\
aaaaaaaaaaaa: Pulling fs layer\n\
aaaaaaaaaaaa: Downloading  1MB/2MB\n\
aaaaaaaaaaaa: Pull complete\n\
Status: Downloaded newer image\n";
        let progress = PullProgress::default();
        progress.process_stream(&input[..]).await.unwrap();
        assert_eq!(progress.snapshot().percentage, 100.0);
        assert_eq!(
            progress.layers()["aaaaaaaaaaaa"].status,
            LayerStatus::PullComplete
        );
    }
}
