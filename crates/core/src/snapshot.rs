//! Point-in-time snapshots of the local store, kept in the object store.
//!
//! Archives live under `backups/<yyyymmdd_HHMMSS>/archive.tar.gz` with a
//! `manifest.json` beside them. Restore verifies the content hash, swaps
//! the store file atomically, and invalidates every sync cursor.

use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{backup_stamp, format_millis, now_millis};
use crate::crypto::sha256_hex;
use crate::errors::{CoreError, Result};
use crate::mode::ModeDetector;
use crate::settings::{BackupSchedule, RuntimeConfig};
use crate::store::{CursorStore, ObjectStore, SharedPeers, WriteBarrier};
use crate::DeploymentMode;

/// Root prefix of snapshot storage.
pub const BACKUP_PREFIX: &str = "backups";

const ARCHIVE_NAME: &str = "archive.tar.gz";
const MANIFEST_NAME: &str = "manifest.json";

/// Upload budget for one archive.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// What a snapshot contains. Whole-store archives carry everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotComponents {
    pub database: bool,
    pub project_data: bool,
    pub templates: bool,
    pub configs: bool,
}

impl SnapshotComponents {
    fn full() -> Self {
        Self {
            database: true,
            project_data: true,
            templates: true,
            configs: true,
        }
    }
}

/// Manifest written beside every archive. Field names are part of the
/// on-bucket contract; do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub backup_date: String,
    pub backup_timestamp: String,
    pub mode: DeploymentMode,
    pub components: SnapshotComponents,
    pub bucket: String,
    pub prefix: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

impl SnapshotManifest {
    /// The stamp identifying this snapshot (`yyyymmdd_HHMMSS`).
    pub fn backup_id(&self) -> &str {
        self.prefix
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.prefix)
    }
}

/// Periodic and on-demand snapshots plus restore.
pub struct SnapshotEngine {
    db_path: PathBuf,
    peers: Arc<SharedPeers>,
    barrier: WriteBarrier,
    detector: Arc<ModeDetector>,
    cursors: Arc<dyn CursorStore>,
    bucket: Mutex<String>,
    retention_days: Mutex<u32>,
    schedule: Mutex<BackupSchedule>,
    restart_tx: watch::Sender<bool>,
}

impl SnapshotEngine {
    pub fn new(
        config: &RuntimeConfig,
        peers: Arc<SharedPeers>,
        barrier: WriteBarrier,
        detector: Arc<ModeDetector>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let (restart_tx, _) = watch::channel(false);
        Self {
            db_path: config.local_db_path.clone(),
            peers,
            barrier,
            detector,
            cursors,
            bucket: Mutex::new(
                config.r2.as_ref().map(|r2| r2.bucket.clone()).unwrap_or_default(),
            ),
            retention_days: Mutex::new(config.backup_retention_days),
            schedule: Mutex::new(config.backup_schedule),
            restart_tx,
        }
    }

    /// Watch that flips to `true` once a restore completed and the local
    /// adapter must be reopened (the server exits 42 on it).
    pub fn restart_requested(&self) -> watch::Receiver<bool> {
        self.restart_tx.subscribe()
    }

    /// Pick up bucket/retention/schedule after a configuration swap.
    pub fn apply_config(&self, config: &RuntimeConfig) {
        *self.bucket.lock().unwrap() = config
            .r2
            .as_ref()
            .map(|r2| r2.bucket.clone())
            .unwrap_or_default();
        *self.retention_days.lock().unwrap() = config.backup_retention_days;
        *self.schedule.lock().unwrap() = config.backup_schedule;
    }

    fn attached_objects(&self) -> Result<Arc<dyn ObjectStore>> {
        self.peers.object().ok_or_else(|| {
            CoreError::PeerUnreachable("no object store attached for snapshots".to_string())
        })
    }

    /// Snapshot into the currently attached object store.
    pub async fn create_backup(&self) -> Result<SnapshotManifest> {
        let objects = self.attached_objects()?;
        let bucket = self.bucket.lock().unwrap().clone();
        self.create_backup_using(objects, &bucket).await
    }

    /// Snapshot into an explicit object store; used by transitions that
    /// introduce the store they are about to attach.
    pub async fn create_backup_using(
        &self,
        objects: Arc<dyn ObjectStore>,
        bucket: &str,
    ) -> Result<SnapshotManifest> {
        let started = now_millis();
        let stamp = backup_stamp(started);
        let prefix = format!("{BACKUP_PREFIX}/{stamp}/");

        // Quiesce writers while the store file is streamed out.
        let archive = {
            let _quiesce = self.barrier.write().await;
            let files = self.collect_store_files().await?;
            tokio::task::spawn_blocking(move || build_archive(files))
                .await
                .map_err(|e| CoreError::internal(format!("archive task panicked: {e}")))??
        };

        let content_hash = sha256_hex(&archive);
        let size_bytes = archive.len() as u64;

        tokio::time::timeout(
            UPLOAD_TIMEOUT,
            objects.put_object(&format!("{prefix}{ARCHIVE_NAME}"), archive),
        )
        .await
        .map_err(|_| CoreError::retryable("snapshot upload timed out"))??;

        let manifest = SnapshotManifest {
            backup_date: format_millis(started).chars().take(10).collect(),
            backup_timestamp: format_millis(started),
            mode: self.detector.current(),
            components: SnapshotComponents::full(),
            bucket: bucket.to_string(),
            prefix: prefix.clone(),
            content_hash,
            size_bytes,
        };
        objects
            .put_object(
                &format!("{prefix}{MANIFEST_NAME}"),
                serde_json::to_vec_pretty(&manifest)?,
            )
            .await?;

        info!("Snapshot {stamp} uploaded ({size_bytes} bytes)");

        if let Err(e) = self.enforce_retention(&objects).await {
            warn!("Snapshot retention sweep failed: {e}");
        }
        Ok(manifest)
    }

    async fn collect_store_files(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        let name = self
            .db_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("flowslide.db")
            .to_string();
        let bytes = tokio::fs::read(&self.db_path).await?;
        files.push((name.clone(), bytes));

        // Sidecar journal files ride along when present.
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
            if let Ok(bytes) = tokio::fs::read(&sidecar).await {
                files.push((format!("{name}{suffix}"), bytes));
            }
        }
        Ok(files)
    }

    /// All manifests in the bucket, newest first.
    pub async fn list_backups(&self) -> Result<Vec<SnapshotManifest>> {
        let objects = self.attached_objects()?;
        let keys = objects.list_objects(&format!("{BACKUP_PREFIX}/")).await?;
        let mut manifests = Vec::new();
        for key in keys.iter().filter(|k| k.ends_with(MANIFEST_NAME)) {
            match objects.get_object(key).await {
                Ok(bytes) => match serde_json::from_slice::<SnapshotManifest>(&bytes) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => warn!("Skipping malformed manifest '{key}': {e}"),
                },
                Err(e) => warn!("Could not read manifest '{key}': {e}"),
            }
        }
        manifests.sort_by(|a, b| b.backup_timestamp.cmp(&a.backup_timestamp));
        Ok(manifests)
    }

    /// Restore a snapshot over the local store.
    ///
    /// The archive is verified against the manifest hash before anything
    /// touches the store file; on mismatch the local store is untouched.
    /// After the swap every cursor is invalidated and a restart is
    /// requested so the local adapter reopens the new file.
    pub async fn restore(&self, backup_id: &str) -> Result<SnapshotManifest> {
        let objects = self.attached_objects()?;
        let prefix = format!("{BACKUP_PREFIX}/{backup_id}/");

        let manifest: SnapshotManifest = serde_json::from_slice(
            &objects.get_object(&format!("{prefix}{MANIFEST_NAME}")).await?,
        )?;
        let archive = objects.get_object(&format!("{prefix}{ARCHIVE_NAME}")).await?;

        if sha256_hex(&archive) != manifest.content_hash {
            return Err(CoreError::CorruptSnapshot(backup_id.to_string()));
        }

        let files = tokio::task::spawn_blocking(move || unpack_archive(&archive))
            .await
            .map_err(|e| CoreError::internal(format!("unpack task panicked: {e}")))??;

        let db_name = self
            .db_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("flowslide.db")
            .to_string();
        let db_bytes = files
            .iter()
            .find(|(name, _)| *name == db_name)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| CoreError::CorruptSnapshot(backup_id.to_string()))?;

        {
            let _quiesce = self.barrier.write().await;
            let staging = PathBuf::from(format!("{}.restore", self.db_path.display()));
            tokio::fs::write(&staging, &db_bytes).await?;
            tokio::fs::rename(&staging, &self.db_path).await?;
            for suffix in ["-wal", "-shm"] {
                let sidecar = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
                let _ = tokio::fs::remove_file(&sidecar).await;
            }
        }

        self.cursors.reset_cursors().await?;
        let _ = self.restart_tx.send(true);
        info!("Restored snapshot {backup_id}; restart required");
        Ok(manifest)
    }

    async fn enforce_retention(&self, objects: &Arc<dyn ObjectStore>) -> Result<()> {
        let retention_days = *self.retention_days.lock().unwrap();
        let cutoff = backup_stamp(now_millis() - (retention_days as i64) * 86_400_000);
        let keys = objects.list_objects(&format!("{BACKUP_PREFIX}/")).await?;
        for key in keys {
            let Some(stamp) = key
                .strip_prefix(&format!("{BACKUP_PREFIX}/"))
                .and_then(|rest| rest.split('/').next())
            else {
                continue;
            };
            if stamp < cutoff.as_str() {
                objects.delete_object(&key).await?;
            }
        }
        Ok(())
    }

    /// Daily schedule loop; skips ticks while no object store is attached.
    pub fn spawn_schedule(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = {
                    let schedule = *engine.schedule.lock().unwrap();
                    Duration::from_millis(schedule.millis_until_next(now_millis()) as u64)
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if engine.peers.object().is_none() {
                            continue;
                        }
                        match engine.create_backup().await {
                            Ok(manifest) => info!("Scheduled snapshot {}", manifest.backup_id()),
                            Err(e) => warn!("Scheduled snapshot failed: {e}"),
                        }
                    }
                }
            }
        })
    }
}

fn build_archive(files: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, bytes) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .map_err(CoreError::Io)?;
    }
    let encoder = builder.into_inner().map_err(CoreError::Io)?;
    encoder.finish().map_err(CoreError::Io)
}

fn unpack_archive(archive: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut files = Vec::new();
    for entry in tar.entries().map_err(CoreError::Io)? {
        let mut entry = entry.map_err(CoreError::Io)?;
        let name = entry
            .path()
            .map_err(CoreError::Io)?
            .to_string_lossy()
            .into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(CoreError::Io)?;
        files.push((name, bytes));
    }
    Ok(files)
}
