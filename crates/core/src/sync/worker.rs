//! Per-(type, direction) sync workers and the shared reconciliation pass.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::now_millis;
use crate::crypto::PayloadCipher;
use crate::errors::{CoreError, Result};
use crate::policy::{SyncDirection, SyncPolicy, SyncStrategy};
use crate::store::{CursorStore, DataType, PutOutcome, Record, StoreAdapter, StoreKind};
use crate::sync::conflict::{resolve, Resolution};

/// Consecutive retryable cycle failures before a worker backs off.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Backoff base and cap.
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 300;

/// Maximum jitter added to periodic ticks.
const TICK_JITTER_SECS: u64 = 5;

/// Per-call timeout for operations against a remote store.
pub const REMOTE_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker prefix of payloads sealed for a remote destination.
const SEALED_PREFIX: &str = "enc:v1:";

/// Exponential backoff delay after the failure threshold is crossed.
pub fn backoff_seconds(excess_failures: u32) -> u64 {
    let exponent = excess_failures.min(6);
    (BACKOFF_BASE_SECS << exponent).min(BACKOFF_CAP_SECS)
}

/// Counters of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub seen: usize,
    pub applied: usize,
    pub skipped_superseded: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub elapsed_ms: i64,
}

/// Status row of one sync flow, aggregated by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub data_type: DataType,
    pub direction: Option<SyncDirection>,
    pub enabled: bool,
    pub strategy: SyncStrategy,
    pub last_run_ms: Option<i64>,
    pub last_result: Option<CycleSummary>,
    pub cursor_watermark_ms: i64,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

impl WorkerStatus {
    pub fn disabled(data_type: DataType, strategy: SyncStrategy) -> Self {
        Self {
            data_type,
            direction: None,
            enabled: false,
            strategy,
            last_run_ms: None,
            last_result: None,
            cursor_watermark_ms: 0,
            degraded: false,
            consecutive_failures: 0,
        }
    }

    pub fn idle(data_type: DataType, direction: SyncDirection, strategy: SyncStrategy) -> Self {
        Self {
            data_type,
            direction: Some(direction),
            enabled: true,
            strategy,
            last_run_ms: None,
            last_result: None,
            cursor_watermark_ms: 0,
            degraded: false,
            consecutive_failures: 0,
        }
    }
}

/// Shared table of worker statuses keyed by `(type, direction)`.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<BTreeMap<(DataType, Option<SyncDirection>), WorkerStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every row (called on reconfiguration).
    pub fn reset(&self, rows: Vec<WorkerStatus>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        for row in rows {
            inner.insert((row.data_type, row.direction), row);
        }
    }

    pub fn update(&self, row: WorkerStatus) {
        self.inner
            .lock()
            .unwrap()
            .insert((row.data_type, row.direction), row);
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// A type is healthy when every enabled flow has completed a cycle
    /// without errors and is not degraded.
    pub fn is_healthy(&self, data_type: DataType) -> bool {
        let inner = self.inner.lock().unwrap();
        let mut enabled_rows = 0;
        for row in inner.values().filter(|r| r.data_type == data_type && r.enabled) {
            enabled_rows += 1;
            let clean = row
                .last_result
                .as_ref()
                .map(|s| s.errors == 0)
                .unwrap_or(false);
            if row.degraded || !clean {
                return false;
            }
        }
        enabled_rows > 0
    }
}

/// Inputs of one reconciliation pass, shared by resident workers and the
/// config sync fast path.
pub(crate) struct PassContext<'a> {
    pub data_type: DataType,
    pub direction: SyncDirection,
    pub strategy: SyncStrategy,
    pub batch_size: usize,
    pub sensitive: bool,
    pub source: &'a Arc<dyn StoreAdapter>,
    pub destination: &'a Arc<dyn StoreAdapter>,
    pub cursors: &'a Arc<dyn CursorStore>,
    pub remote_ops: &'a Arc<Semaphore>,
    pub cipher: Option<&'a Arc<PayloadCipher>>,
    pub hot_filter: Option<&'a HashSet<String>>,
    pub cancel: &'a CancellationToken,
}

/// Result of one pass: counters plus the ids applied on the destination.
pub(crate) struct PassOutcome {
    pub summary: CycleSummary,
    pub applied_ids: Vec<String>,
}

async fn remote_call<T>(
    is_remote: bool,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    if is_remote {
        match tokio::time::timeout(REMOTE_OP_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::retryable("remote store call timed out")),
        }
    } else {
        fut.await
    }
}

fn seal_for_destination(record: &Record, cipher: &PayloadCipher) -> Result<Record> {
    if record.payload.is_empty() || record.payload.starts_with(SEALED_PREFIX) {
        return Ok(record.clone());
    }
    let sealed = cipher.seal(record.payload.as_bytes())?;
    let mut out = record.clone();
    out.payload = format!(
        "{SEALED_PREFIX}{}",
        sealed.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    );
    Ok(out)
}

fn open_from_source(record: &Record, cipher: &PayloadCipher) -> Result<Record> {
    let Some(hex) = record.payload.strip_prefix(SEALED_PREFIX) else {
        return Ok(record.clone());
    };
    let mut sealed = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let s = std::str::from_utf8(chunk)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| CoreError::store("malformed sealed payload"))?;
        sealed.push(s);
    }
    let plain = cipher.open(&sealed)?;
    let mut out = record.clone();
    out.payload = String::from_utf8(plain)
        .map_err(|_| CoreError::store("sealed payload is not valid UTF-8"))?;
    Ok(out)
}

/// One incremental reconciliation pass from source to destination.
///
/// The cursor only advances over records that were processed successfully;
/// the first error stops advancement so the record is retried next cycle.
pub(crate) async fn run_sync_pass(ctx: PassContext<'_>) -> Result<PassOutcome> {
    let started = std::time::Instant::now();
    let mut summary = CycleSummary::default();
    let mut applied_ids = Vec::new();

    let source_remote = ctx.source.kind() != StoreKind::Local;
    let destination_remote = ctx.destination.kind() != StoreKind::Local;
    let peer = if source_remote {
        ctx.source.kind()
    } else {
        ctx.destination.kind()
    };

    // One permit covers the whole pass; this caps concurrent passes that
    // touch a remote store, protecting its connection pool.
    let _permit = if source_remote || destination_remote {
        Some(
            ctx.remote_ops
                .acquire()
                .await
                .map_err(|_| CoreError::internal("remote op semaphore closed"))?,
        )
    } else {
        None
    };

    let mut cursor = ctx.cursors.load_cursor(ctx.data_type, ctx.direction).await?;

    let batch = remote_call(
        source_remote,
        ctx.source
            .list_since(ctx.data_type, cursor.watermark_ms, ctx.batch_size),
    )
    .await?;

    let mut pass_error: Option<CoreError> = None;

    for record in &batch {
        if cursor.already_applied(record) {
            continue;
        }
        summary.seen += 1;

        if let Some(hot) = ctx.hot_filter {
            if !hot.contains(&record.id) {
                // Cold records are passed over; they re-enter the feed when
                // the project is touched again.
                cursor.advance(record);
                continue;
            }
        }

        let result = apply_record(&ctx, record, peer, destination_remote).await;
        match result {
            Ok(outcome) => {
                match outcome {
                    RecordOutcome::Applied => {
                        summary.applied += 1;
                        applied_ids.push(record.id.clone());
                    }
                    RecordOutcome::SkippedSuperseded => summary.skipped_superseded += 1,
                    RecordOutcome::ConflictResolved => {
                        summary.conflicts += 1;
                        applied_ids.push(record.id.clone());
                    }
                    RecordOutcome::ConflictKept => summary.conflicts += 1,
                }
                cursor.advance(record);
            }
            Err(e) => {
                summary.errors += 1;
                error!(
                    "Sync {}/{} failed on record '{}': {}",
                    ctx.data_type,
                    ctx.direction.as_str(),
                    record.id,
                    e
                );
                pass_error = Some(e);
                break;
            }
        }

        if ctx.cancel.is_cancelled() {
            debug!(
                "Sync {}/{} cancelled after in-flight record",
                ctx.data_type,
                ctx.direction.as_str()
            );
            break;
        }
    }

    summary.elapsed_ms = started.elapsed().as_millis() as i64;
    ctx.cursors
        .save_cursor(ctx.data_type, ctx.direction, &cursor)
        .await?;

    match pass_error {
        Some(e) if e.is_retryable() => Err(e),
        _ => Ok(PassOutcome {
            summary,
            applied_ids,
        }),
    }
}

enum RecordOutcome {
    Applied,
    SkippedSuperseded,
    ConflictResolved,
    ConflictKept,
}

async fn apply_record(
    ctx: &PassContext<'_>,
    record: &Record,
    peer: StoreKind,
    destination_remote: bool,
) -> Result<RecordOutcome> {
    // Sensitive payloads are sealed before leaving the local process and
    // opened when they come back.
    let record = match (ctx.sensitive, ctx.cipher) {
        (true, Some(cipher)) if destination_remote => seal_for_destination(record, cipher)?,
        (true, Some(cipher)) => open_from_source(record, cipher)?,
        _ => record.clone(),
    };

    let write = |r: Record| async move {
        if r.deleted {
            remote_call(
                destination_remote,
                ctx.destination.delete(r.data_type, &r.id, r.updated_at),
            )
            .await
        } else {
            remote_call(destination_remote, ctx.destination.put(&r)).await
        }
    };

    match ctx.strategy {
        SyncStrategy::MasterSlave | SyncStrategy::BackupOnly => {
            // The destination accepts the source unconditionally; the
            // object log is append-only so no conflict check applies.
            match write(record).await? {
                PutOutcome::Applied => Ok(RecordOutcome::Applied),
                PutOutcome::Superseded => Ok(RecordOutcome::SkippedSuperseded),
            }
        }
        SyncStrategy::FullDuplex | SyncStrategy::OnDemand => {
            let current = remote_call(
                destination_remote,
                ctx.destination.get(record.data_type, &record.id),
            )
            .await?;

            match current {
                None => match write(record).await? {
                    PutOutcome::Applied => Ok(RecordOutcome::Applied),
                    PutOutcome::Superseded => Ok(RecordOutcome::SkippedSuperseded),
                },
                Some(current) => {
                    if current == record {
                        return Ok(RecordOutcome::SkippedSuperseded);
                    }
                    let contested = current.updated_at == record.updated_at;
                    match resolve(&record, &current, peer) {
                        Resolution::ApplyIncoming => match write(record).await? {
                            PutOutcome::Applied if contested => Ok(RecordOutcome::ConflictResolved),
                            PutOutcome::Applied => Ok(RecordOutcome::Applied),
                            PutOutcome::Superseded => Ok(RecordOutcome::SkippedSuperseded),
                        },
                        Resolution::KeepCurrent if contested => Ok(RecordOutcome::ConflictKept),
                        Resolution::KeepCurrent => Ok(RecordOutcome::SkippedSuperseded),
                    }
                }
            }
        }
        SyncStrategy::LocalOnly => Err(CoreError::internal(
            "local_only types must not reach the sync pass",
        )),
    }
}

/// Handle of a spawned worker, owned by the engine.
pub(crate) struct WorkerHandle {
    pub data_type: DataType,
    pub direction: SyncDirection,
    pub trigger_tx: mpsc::Sender<oneshot::Sender<Result<CycleSummary>>>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

pub(crate) struct WorkerParams {
    pub data_type: DataType,
    pub direction: SyncDirection,
    pub policy: SyncPolicy,
    pub source: Arc<dyn StoreAdapter>,
    pub destination: Arc<dyn StoreAdapter>,
    pub cursors: Arc<dyn CursorStore>,
    pub remote_ops: Arc<Semaphore>,
    pub statuses: Arc<StatusBoard>,
    pub cipher: Option<Arc<PayloadCipher>>,
    pub hot_projects: Arc<RwLock<HashSet<String>>>,
}

/// Spawn the resident loop for one sync flow.
pub(crate) fn spawn_worker(params: WorkerParams) -> WorkerHandle {
    let cancel = CancellationToken::new();
    let (trigger_tx, trigger_rx) = mpsc::channel(4);
    let data_type = params.data_type;
    let direction = params.direction;
    let join = tokio::spawn(worker_loop(params, cancel.clone(), trigger_rx));
    WorkerHandle {
        data_type,
        direction,
        trigger_tx,
        cancel,
        join,
    }
}

async fn worker_loop(
    params: WorkerParams,
    cancel: CancellationToken,
    mut trigger_rx: mpsc::Receiver<oneshot::Sender<Result<CycleSummary>>>,
) {
    let mut consecutive_failures: u32 = 0;

    params.statuses.update(WorkerStatus::idle(
        params.data_type,
        params.direction,
        params.policy.strategy,
    ));

    if params.policy.startup_sync {
        run_worker_cycle(&params, &cancel, &mut consecutive_failures).await.ok();
    }

    loop {
        let wait = if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            Duration::from_secs(backoff_seconds(
                consecutive_failures - MAX_CONSECUTIVE_FAILURES,
            ))
        } else {
            let jitter = rand::thread_rng().gen_range(0..=TICK_JITTER_SECS);
            Duration::from_secs(params.policy.interval_seconds + jitter)
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(ack) = trigger_rx.recv() => {
                let result = run_worker_cycle(&params, &cancel, &mut consecutive_failures).await;
                let _ = ack.send(result);
            }
            _ = tokio::time::sleep(wait) => {
                run_worker_cycle(&params, &cancel, &mut consecutive_failures).await.ok();
            }
        }
    }
    debug!(
        "Sync worker {}/{} stopped",
        params.data_type,
        params.direction.as_str()
    );
}

async fn run_worker_cycle(
    params: &WorkerParams,
    cancel: &CancellationToken,
    consecutive_failures: &mut u32,
) -> Result<CycleSummary> {
    let hot = matches!(params.policy.strategy, SyncStrategy::OnDemand)
        .then(|| params.hot_projects.read().unwrap().clone());
    if let Some(hot) = &hot {
        if hot.is_empty() {
            // Nothing in the working set; skip the pass entirely.
            return Ok(CycleSummary::default());
        }
    }

    let result = run_sync_pass(PassContext {
        data_type: params.data_type,
        direction: params.direction,
        strategy: params.policy.strategy,
        batch_size: params.policy.batch_size,
        sensitive: params.policy.sensitive,
        source: &params.source,
        destination: &params.destination,
        cursors: &params.cursors,
        remote_ops: &params.remote_ops,
        cipher: params.cipher.as_ref(),
        hot_filter: hot.as_ref(),
        cancel,
    })
    .await;

    let cursor_watermark = params
        .cursors
        .load_cursor(params.data_type, params.direction)
        .await
        .map(|c| c.watermark_ms)
        .unwrap_or(0);

    let (summary, failed) = match &result {
        Ok(pass) => (Some(pass.summary.clone()), false),
        Err(e) => {
            warn!(
                "Sync cycle {}/{} failed: {}",
                params.data_type,
                params.direction.as_str(),
                e
            );
            (None, true)
        }
    };

    if failed {
        *consecutive_failures += 1;
    } else {
        *consecutive_failures = 0;
    }
    let degraded = *consecutive_failures >= MAX_CONSECUTIVE_FAILURES;

    params.statuses.update(WorkerStatus {
        data_type: params.data_type,
        direction: Some(params.direction),
        enabled: true,
        strategy: params.policy.strategy,
        last_run_ms: Some(now_millis()),
        last_result: summary.clone(),
        cursor_watermark_ms: cursor_watermark,
        degraded,
        consecutive_failures: *consecutive_failures,
    });

    result.map(|pass| pass.summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_seconds(0), 5);
        assert_eq!(backoff_seconds(1), 10);
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(6), 300);
        assert_eq!(backoff_seconds(60), 300);
    }

    #[test]
    fn sealed_payload_round_trip() {
        let cipher = PayloadCipher::new(&[3u8; 32]);
        let record = Record::new(
            DataType::SystemConfigs,
            "jwt_secret",
            "{\"value\":\"tops3cret\"}",
            100,
            StoreKind::Local,
        );
        let sealed = seal_for_destination(&record, &cipher).unwrap();
        assert!(sealed.payload.starts_with(SEALED_PREFIX));

        let opened = open_from_source(&sealed, &cipher).unwrap();
        assert_eq!(opened.payload, record.payload);

        // Sealing is not reapplied to an already sealed payload.
        let resealed = seal_for_destination(&sealed, &cipher).unwrap();
        assert_eq!(resealed.payload, sealed.payload);
    }

    #[test]
    fn status_board_health_requires_clean_runs() {
        let board = StatusBoard::new();
        board.update(WorkerStatus::disabled(DataType::UserSessions, SyncStrategy::LocalOnly));
        assert!(!board.is_healthy(DataType::UserSessions));

        let mut row = WorkerStatus::idle(
            DataType::Users,
            SyncDirection::LocalToExternal,
            SyncStrategy::FullDuplex,
        );
        board.update(row.clone());
        // Idle rows have not completed a cycle yet.
        assert!(!board.is_healthy(DataType::Users));

        row.last_result = Some(CycleSummary::default());
        board.update(row.clone());
        assert!(board.is_healthy(DataType::Users));

        row.degraded = true;
        board.update(row);
        assert!(!board.is_healthy(DataType::Users));
    }
}
