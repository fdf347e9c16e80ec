use std::{
    future::Future,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, de::DeserializeOwned};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::OnceCell,
    task::spawn_blocking,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    encryption::EnvelopeEncryptor,
    envelope::EncryptedEnvelope,
    error::{Result, VaultError},
    io::{RetryPolicy, guarded},
    keys::WrappedKey,
    locks::{DEFAULT_LOCK_SHARDS, LockTable},
    model::{AggregateMetadata, PatchEvent, VersionedAggregate},
    validation::{DELETED_MARKER, ensure_aggregate_id, ensure_owner_id},
};

const PROJECTS_DIR: &str = "projects";
const USERS_DIR: &str = "users";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_SUFFIX: &str = ".enc";
const EVENT_LOG_PREFIX: &str = "events_";
const EVENT_LOG_SUFFIX: &str = ".log";
const META_SUFFIX: &str = ".meta.json";

/// Result of a version-checked write. A conflict is an expected outcome, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { version: u32 },
    /// `actual` is 0 when the aggregate does not exist.
    Conflict { expected: u32, actual: u32 },
}

impl UpdateOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }

    pub fn actual_version(&self) -> u32 {
        match self {
            Self::Updated { version } => *version,
            Self::Conflict { actual, .. } => *actual,
        }
    }

    pub fn into_result(self, aggregate_id: &str) -> Result<u32> {
        match self {
            Self::Updated { version } => Ok(version),
            Self::Conflict { expected, actual } => Err(VaultError::VersionConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual,
            }),
        }
    }
}

/// Only the part of a snapshot needed to find its owner's index entry.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    owner_id: String,
}

/// Encrypted, versioned aggregate storage rooted at one directory:
///
/// ```text
/// projects/{id}/snapshot_{version:010}.enc
/// projects/{id}/events_{yyyyMM}.log
/// projects/{id}.deleted.{unixSeconds}/
/// users/{ownerId}/projects/{id}.meta.json
/// ```
pub struct DocumentStore {
    root: PathBuf,
    encryptor: Arc<EnvelopeEncryptor>,
    locks: LockTable,
    retry: RetryPolicy,
    layout: OnceCell<()>,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>, encryptor: Arc<EnvelopeEncryptor>) -> Self {
        Self {
            root: root.into(),
            encryptor,
            locks: LockTable::new(DEFAULT_LOCK_SHARDS),
            retry: RetryPolicy::default(),
            layout: OnceCell::new(),
        }
    }

    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = LockTable::new(shards);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn encryptor(&self) -> &EnvelopeEncryptor {
        &self.encryptor
    }

    /// Writes `aggregate` as a new immutable snapshot tagged with its version
    /// and upserts the owner's listing entry.
    pub async fn save_snapshot<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        aggregate: &A,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_aggregate_id(aggregate_id)?;
        ensure_same_aggregate(aggregate_id, aggregate.aggregate_id())?;
        measured(
            "save_snapshot",
            guarded(cancel, async {
                let _guard = self.locks.lock(aggregate_id).await;
                self.save_snapshot_locked(aggregate_id, aggregate).await
            }),
        )
        .await
    }

    /// Loads the snapshot with the highest version, or `None` if the
    /// aggregate does not exist.
    pub async fn load_snapshot<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<A>> {
        ensure_aggregate_id(aggregate_id)?;
        measured(
            "load_snapshot",
            guarded(cancel, self.read_latest(&self.project_dir(aggregate_id), aggregate_id)),
        )
        .await
    }

    /// Loads the latest snapshot stored in `dir`, which may be a soft-deleted
    /// copy returned by [`DocumentStore::deleted_copies`].
    pub async fn load_snapshot_from<A: VersionedAggregate>(
        &self,
        dir: &Path,
        aggregate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<A>> {
        ensure_aggregate_id(aggregate_id)?;
        measured("load_snapshot_from", guarded(cancel, self.read_latest(dir, aggregate_id))).await
    }

    pub async fn append_event(
        &self,
        aggregate_id: &str,
        event: &PatchEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_aggregate_id(aggregate_id)?;
        ensure_event_shape(aggregate_id, event)?;
        measured(
            "append_event",
            guarded(cancel, async {
                let _guard = self.locks.lock(aggregate_id).await;
                self.append_event_locked(aggregate_id, event).await
            }),
        )
        .await
    }

    /// Events with `base_version >= since_version`, ordered by result version.
    pub async fn load_events(
        &self,
        aggregate_id: &str,
        since_version: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<PatchEvent>> {
        ensure_aggregate_id(aggregate_id)?;
        measured(
            "load_events",
            guarded(cancel, self.read_events(aggregate_id, since_version)),
        )
        .await
    }

    pub async fn list_projects(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregateMetadata>> {
        ensure_owner_id(owner_id)?;
        measured("list_projects", guarded(cancel, self.read_index(owner_id))).await
    }

    /// Soft delete. Returns `false` when there was nothing to delete.
    pub async fn delete_project(
        &self,
        aggregate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        ensure_aggregate_id(aggregate_id)?;
        measured(
            "delete_project",
            guarded(cancel, async {
                let _guard = self.locks.lock(aggregate_id).await;
                self.delete_project_locked(aggregate_id).await
            }),
        )
        .await
    }

    /// Soft-deleted directories for `aggregate_id`, oldest name first.
    pub async fn deleted_copies(
        &self,
        aggregate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        ensure_aggregate_id(aggregate_id)?;
        guarded(cancel, async {
            let projects = self.root.join(PROJECTS_DIR);
            let mut names: Vec<String> = self
                .retry
                .run("list_projects_dir", || list_names(&projects))
                .await?
                .into_iter()
                .filter(|name| is_deleted_copy_of(name, aggregate_id))
                .collect();
            names.sort();
            Ok(names.into_iter().map(|name| projects.join(name)).collect())
        })
        .await
    }

    pub async fn exists(&self, aggregate_id: &str, cancel: &CancellationToken) -> Result<bool> {
        ensure_aggregate_id(aggregate_id)?;
        guarded(cancel, async {
            Ok(self
                .latest_snapshot(&self.project_dir(aggregate_id))
                .await?
                .is_some())
        })
        .await
    }

    /// Persists `updated` as version `expected_version + 1` only if the stored
    /// version is still `expected_version`. On success `updated` carries the
    /// stamped version and timestamp; on conflict it is left untouched.
    pub async fn try_update_with_version_check<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        expected_version: u32,
        updated: &mut A,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        ensure_aggregate_id(aggregate_id)?;
        ensure_same_aggregate(aggregate_id, updated.aggregate_id())?;
        measured(
            "try_update_with_version_check",
            guarded(cancel, async {
                let _guard = self.locks.lock(aggregate_id).await;
                self.versioned_write_locked(aggregate_id, expected_version, updated, None)
                    .await
            }),
        )
        .await
    }

    /// Version check, snapshot write and event append under a single
    /// acquisition of the aggregate lock.
    pub async fn try_commit_patch<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        expected_version: u32,
        updated: &mut A,
        event: &PatchEvent,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        ensure_aggregate_id(aggregate_id)?;
        ensure_same_aggregate(aggregate_id, updated.aggregate_id())?;
        ensure_event_shape(aggregate_id, event)?;
        if event.base_version != expected_version {
            return Err(VaultError::InvalidEvent(format!(
                "event base version {} does not match expected version {expected_version}",
                event.base_version
            )));
        }
        measured(
            "try_commit_patch",
            guarded(cancel, async {
                let _guard = self.locks.lock(aggregate_id).await;
                self.versioned_write_locked(aggregate_id, expected_version, updated, Some(event))
                    .await
            }),
        )
        .await
    }

    /// Provisions the data key for a new aggregate. Fails with `KeyExists`
    /// rather than replacing a live key.
    pub async fn generate_key(
        &self,
        aggregate_id: &str,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WrappedKey> {
        ensure_aggregate_id(aggregate_id)?;
        ensure_owner_id(owner_id)?;
        measured(
            "generate_key",
            guarded(cancel, async {
                spawn_blocking({
                    let encryptor = Arc::clone(&self.encryptor);
                    let aggregate_id = aggregate_id.to_string();
                    let owner_id = owner_id.to_string();
                    move || encryptor.generate_key(&aggregate_id, &owner_id)
                })
                .await
                .map_err(|err| VaultError::Storage(format!("generate key task failed: {err}")))?
            }),
        )
        .await
    }

    fn project_dir(&self, aggregate_id: &str) -> PathBuf {
        self.root.join(PROJECTS_DIR).join(aggregate_id)
    }

    fn index_dir(&self, owner_id: &str) -> PathBuf {
        self.root.join(USERS_DIR).join(owner_id).join(PROJECTS_DIR)
    }

    async fn ensure_layout(&self) -> Result<()> {
        self.layout
            .get_or_try_init(|| async {
                fs::create_dir_all(self.root.join(PROJECTS_DIR)).await?;
                fs::create_dir_all(self.root.join(USERS_DIR)).await?;
                debug!(root = %self.root.display(), "storage layout initialised");
                Ok::<(), VaultError>(())
            })
            .await?;
        Ok(())
    }

    async fn versioned_write_locked<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        expected_version: u32,
        updated: &mut A,
        event: Option<&PatchEvent>,
    ) -> Result<UpdateOutcome> {
        let current: Option<A> = self
            .read_latest(&self.project_dir(aggregate_id), aggregate_id)
            .await?;
        let Some(current) = current else {
            return Ok(UpdateOutcome::Conflict {
                expected: expected_version,
                actual: 0,
            });
        };
        if current.version() != expected_version {
            debug!(
                aggregate_id,
                expected = expected_version,
                actual = current.version(),
                "version check failed"
            );
            return Ok(UpdateOutcome::Conflict {
                expected: expected_version,
                actual: current.version(),
            });
        }

        let next = expected_version.checked_add(1).ok_or_else(|| {
            VaultError::Storage(format!("version counter exhausted for {aggregate_id}"))
        })?;
        updated.set_version(next);
        updated.touch(Utc::now());
        self.save_snapshot_locked(aggregate_id, &*updated).await?;
        if current.owner_id() != updated.owner_id() {
            self.remove_index_entry(current.owner_id(), aggregate_id)
                .await?;
        }
        if let Some(event) = event {
            self.append_event_locked(aggregate_id, event).await?;
        }
        Ok(UpdateOutcome::Updated { version: next })
    }

    async fn save_snapshot_locked<A: VersionedAggregate>(
        &self,
        aggregate_id: &str,
        aggregate: &A,
    ) -> Result<()> {
        ensure_owner_id(aggregate.owner_id())?;
        self.ensure_layout().await?;

        let dir = self.project_dir(aggregate_id);
        self.retry
            .run("create_project_dir", || fs::create_dir_all(&dir))
            .await?;

        let plaintext = serde_json::to_vec(aggregate)?;
        let frame = self.seal(aggregate_id, plaintext).await?.encode()?;

        let version = aggregate.version();
        let target = dir.join(snapshot_file_name(version));
        let staging = dir.join(format!(".{}.{}.tmp", snapshot_file_name(version), Uuid::new_v4()));
        self.retry
            .run("write_snapshot", || write_synced(&staging, &frame))
            .await?;

        // The hard link fails instead of replacing an existing version file.
        let linked = self
            .retry
            .run("link_snapshot", || fs::hard_link(&staging, &target))
            .await;
        if let Err(err) = fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %err, "failed to remove staged snapshot");
        }
        match linked {
            Ok(()) => {}
            Err(VaultError::Io(err)) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(VaultError::SnapshotExists {
                    aggregate_id: aggregate_id.to_string(),
                    version,
                });
            }
            Err(err) => return Err(err),
        }

        self.write_index_entry(&aggregate.metadata()).await?;
        debug!(aggregate_id, version, bytes = frame.len(), "snapshot written");
        Ok(())
    }

    async fn write_index_entry(&self, metadata: &AggregateMetadata) -> Result<()> {
        let dir = self.index_dir(&metadata.owner_id);
        self.retry
            .run("create_index_dir", || fs::create_dir_all(&dir))
            .await?;
        let target = dir.join(format!("{}{META_SUFFIX}", metadata.id));
        let staging = dir.join(format!(".{}{META_SUFFIX}.{}.tmp", metadata.id, Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(metadata)?;
        self.retry
            .run("write_index_entry", || write_synced(&staging, &body))
            .await?;
        self.retry
            .run("publish_index_entry", || fs::rename(&staging, &target))
            .await?;
        Ok(())
    }

    async fn remove_index_entry(&self, owner_id: &str, aggregate_id: &str) -> Result<()> {
        let path = self
            .index_dir(owner_id)
            .join(format!("{aggregate_id}{META_SUFFIX}"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_index(&self, owner_id: &str) -> Result<Vec<AggregateMetadata>> {
        let dir = self.index_dir(owner_id);
        let names = self
            .retry
            .run("list_index", || list_names(&dir))
            .await?;
        let mut projects = Vec::new();
        for name in names {
            if name.starts_with('.') || !name.ends_with(META_SUFFIX) {
                continue;
            }
            let path = dir.join(&name);
            let bytes = self.retry.run("read_index_entry", || fs::read(&path)).await?;
            projects.push(serde_json::from_slice::<AggregateMetadata>(&bytes)?);
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn latest_snapshot(&self, dir: &Path) -> Result<Option<(u32, PathBuf)>> {
        let names = self
            .retry
            .run("list_snapshots", || list_names(dir))
            .await?;
        Ok(names
            .iter()
            .filter_map(|name| parse_snapshot_version(name).map(|version| (version, name)))
            .max_by_key(|(version, _)| *version)
            .map(|(version, name)| (version, dir.join(name))))
    }

    async fn read_snapshot_plaintext(&self, dir: &Path, aggregate_id: &str) -> Result<Option<Vec<u8>>> {
        let Some((version, path)) = self.latest_snapshot(dir).await? else {
            return Ok(None);
        };
        let frame = self.retry.run("read_snapshot", || fs::read(&path)).await?;
        let envelope = EncryptedEnvelope::decode(&frame)?;
        let plaintext = self.open(envelope, aggregate_id).await?;
        debug!(aggregate_id, version, "snapshot loaded");
        Ok(Some(plaintext))
    }

    async fn read_latest<A: DeserializeOwned>(&self, dir: &Path, aggregate_id: &str) -> Result<Option<A>> {
        match self.read_snapshot_plaintext(dir, aggregate_id).await? {
            Some(plaintext) => Ok(Some(serde_json::from_slice(&plaintext)?)),
            None => Ok(None),
        }
    }

    async fn append_event_locked(&self, aggregate_id: &str, event: &PatchEvent) -> Result<()> {
        self.ensure_layout().await?;
        let dir = self.project_dir(aggregate_id);
        self.retry
            .run("create_project_dir", || fs::create_dir_all(&dir))
            .await?;

        let plaintext = serde_json::to_vec(event)?;
        let mut record = self.seal(aggregate_id, plaintext).await?.encode_line()?;
        record.push('\n');

        let path = dir.join(event_log_name(event));
        if let Some(dropped) = self
            .retry
            .run("repair_event_log", || truncate_torn_tail(&path))
            .await?
        {
            warn!(aggregate_id, path = %path.display(), dropped, "truncated torn event record");
        }
        let mut file = self
            .retry
            .run("open_event_log", || {
                let path = &path;
                async move {
                    fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .await
                }
            })
            .await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(
            aggregate_id,
            change_set_id = %event.change_set_id,
            result_version = event.result_version,
            "event appended"
        );
        Ok(())
    }

    async fn read_events(&self, aggregate_id: &str, since_version: u32) -> Result<Vec<PatchEvent>> {
        let dir = self.project_dir(aggregate_id);
        let mut logs: Vec<String> = self
            .retry
            .run("list_event_logs", || list_names(&dir))
            .await?
            .into_iter()
            .filter(|name| name.starts_with(EVENT_LOG_PREFIX) && name.ends_with(EVENT_LOG_SUFFIX))
            .collect();
        logs.sort();

        let mut events = Vec::new();
        for name in logs {
            let path = dir.join(&name);
            let content = self
                .retry
                .run("read_event_log", || fs::read_to_string(&path))
                .await?;
            let decoded = spawn_blocking({
                let encryptor = Arc::clone(&self.encryptor);
                let aggregate_id = aggregate_id.to_string();
                move || decode_event_log(&encryptor, &aggregate_id, &name, &content)
            })
            .await
            .map_err(|err| VaultError::Storage(format!("decode event log task failed: {err}")))?;
            events.extend(
                decoded?
                    .into_iter()
                    .filter(|event| event.base_version >= since_version),
            );
        }
        events.sort_by_key(|event| event.result_version);
        Ok(events)
    }

    async fn delete_project_locked(&self, aggregate_id: &str) -> Result<bool> {
        let dir = self.project_dir(aggregate_id);
        if !fs::try_exists(&dir).await? {
            debug!(aggregate_id, "delete of absent project ignored");
            return Ok(false);
        }

        let owner = match self.read_latest::<SnapshotHeader>(&dir, aggregate_id).await {
            Ok(header) => header.map(|header| header.owner_id),
            Err(err) => {
                warn!(aggregate_id, error = %err, "cannot read owner from snapshot, scanning index");
                None
            }
        };

        let target = self.soft_delete_target(aggregate_id).await?;
        self.retry
            .run("soft_delete", || fs::rename(&dir, &target))
            .await?;

        match owner {
            Some(owner) => self.remove_index_entry(&owner, aggregate_id).await?,
            None => {
                let users = self.root.join(USERS_DIR);
                for owner in self.retry.run("list_owners", || list_names(&users)).await? {
                    self.remove_index_entry(&owner, aggregate_id).await?;
                }
            }
        }
        info!(aggregate_id, target = %target.display(), "project soft-deleted");
        Ok(true)
    }

    async fn soft_delete_target(&self, aggregate_id: &str) -> Result<PathBuf> {
        let projects = self.root.join(PROJECTS_DIR);
        let base = format!("{aggregate_id}{DELETED_MARKER}{}", Utc::now().timestamp());
        let mut candidate = projects.join(&base);
        let mut suffix = 1;
        while fs::try_exists(&candidate).await? {
            candidate = projects.join(format!("{base}-{suffix}"));
            suffix += 1;
        }
        Ok(candidate)
    }

    /// Encrypts off the async workers: a key-cache miss reads or provisions
    /// the wrapped key through the vault.
    async fn seal(&self, aggregate_id: &str, plaintext: Vec<u8>) -> Result<EncryptedEnvelope> {
        spawn_blocking({
            let encryptor = Arc::clone(&self.encryptor);
            let aggregate_id = aggregate_id.to_string();
            move || encryptor.encrypt(&plaintext, &aggregate_id)
        })
        .await
        .map_err(|err| VaultError::Storage(format!("encrypt task failed: {err}")))?
    }

    async fn open(&self, envelope: EncryptedEnvelope, aggregate_id: &str) -> Result<Vec<u8>> {
        spawn_blocking({
            let encryptor = Arc::clone(&self.encryptor);
            let aggregate_id = aggregate_id.to_string();
            move || encryptor.decrypt(&envelope, &aggregate_id)
        })
        .await
        .map_err(|err| VaultError::Storage(format!("decrypt task failed: {err}")))?
    }
}

/// Decrypts every record of one monthly log. A file that does not end in a
/// newline was cut mid-append, so its final record is dropped whatever error
/// it produces. An undecodable final line is dropped too. Any other failure,
/// including a complete record that fails authentication, is returned.
fn decode_event_log(
    encryptor: &EnvelopeEncryptor,
    aggregate_id: &str,
    log_name: &str,
    content: &str,
) -> Result<Vec<PatchEvent>> {
    let torn_tail = !content.is_empty() && !content.ends_with('\n');
    let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let envelope = match EncryptedEnvelope::decode_line(line) {
            Ok(envelope) => envelope,
            Err(err) if index == last => {
                warn!(aggregate_id, log = log_name, error = %err, "skipping torn final event record");
                continue;
            }
            Err(err) => return Err(err),
        };
        match decrypt_event(encryptor, aggregate_id, &envelope) {
            Ok(event) => events.push(event),
            Err(err) if torn_tail && index == last => {
                warn!(aggregate_id, log = log_name, error = %err, "skipping unterminated final event record");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(events)
}

fn decrypt_event(
    encryptor: &EnvelopeEncryptor,
    aggregate_id: &str,
    envelope: &EncryptedEnvelope,
) -> Result<PatchEvent> {
    let plaintext = encryptor.decrypt(envelope, aggregate_id)?;
    let event: PatchEvent = serde_json::from_slice(&plaintext)?;
    ensure_same_aggregate(aggregate_id, &event.aggregate_id)?;
    Ok(event)
}

/// Matches `{id}.deleted.{secs}` and `{id}.deleted.{secs}-{n}`, and nothing
/// left by deleting a longer id that happens to share the prefix.
fn is_deleted_copy_of(name: &str, aggregate_id: &str) -> bool {
    let Some(stamp) = name
        .strip_prefix(aggregate_id)
        .and_then(|rest| rest.strip_prefix(DELETED_MARKER))
    else {
        return false;
    };
    let (seconds, counter) = match stamp.split_once('-') {
        Some((seconds, counter)) => (seconds, Some(counter)),
        None => (stamp, None),
    };
    let all_digits = |token: &str| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit());
    all_digits(seconds) && counter.is_none_or(all_digits)
}

pub fn snapshot_file_name(version: u32) -> String {
    format!("{SNAPSHOT_PREFIX}{version:010}{SNAPSHOT_SUFFIX}")
}

/// Parses the version token as an integer, so padded and unpadded names
/// compare by value.
pub fn parse_snapshot_version(file_name: &str) -> Option<u32> {
    let token = file_name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn event_log_name(event: &PatchEvent) -> String {
    format!(
        "{EVENT_LOG_PREFIX}{}{EVENT_LOG_SUFFIX}",
        event.timestamp.format("%Y%m")
    )
}

fn ensure_same_aggregate(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(VaultError::AggregateMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn ensure_event_shape(aggregate_id: &str, event: &PatchEvent) -> Result<()> {
    ensure_same_aggregate(aggregate_id, &event.aggregate_id)?;
    if event.base_version.checked_add(1) != Some(event.result_version) {
        return Err(VaultError::InvalidEvent(format!(
            "result version {} must follow base version {}",
            event.result_version, event.base_version
        )));
    }
    Ok(())
}

async fn measured<T>(operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    let start = Instant::now();
    let result = fut.await;
    record_store_op(
        operation,
        if result.is_ok() { "ok" } else { "err" },
        start.elapsed().as_secs_f64(),
    );
    result
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("docvault_store_operations_total", &labels).increment(1);
    histogram!("docvault_store_operation_duration_seconds", &labels).record(duration);
}

async fn list_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Drops a partial record left at the end of a log by an interrupted append.
/// Returns the number of bytes removed.
async fn truncate_torn_tail(path: &Path) -> io::Result<Option<u64>> {
    let mut file = match fs::OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(None);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(0)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |newline| newline + 1) as u64;
    file.set_len(keep).await?;
    file.sync_data().await?;
    Ok(Some(len - keep))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::{
        encryption::KeyEncryptionKey,
        keys::InMemoryKeyVault,
        model::Project,
        patch::PatchOperation,
    };

    fn store_at(root: &Path) -> DocumentStore {
        let kek = KeyEncryptionKey::new_from_base64("kek-1", &KeyEncryptionKey::generate_base64())
            .expect("kek");
        let encryptor = EnvelopeEncryptor::new(kek, Arc::new(InMemoryKeyVault::new()), 16);
        DocumentStore::new(root, Arc::new(encryptor)).with_retry(RetryPolicy {
            attempts: 2,
            backoff_ms: 1,
        })
    }

    fn project_at(version: u32) -> Project {
        let mut project = Project::new("p1", "owner-1", format!("Household v{version}"));
        project.version = version;
        project
    }

    fn event(base_version: u32) -> PatchEvent {
        PatchEvent::new(
            "p1",
            "user-1",
            base_version,
            vec![PatchOperation::replace("/name", json!(format!("v{}", base_version + 1)))],
        )
    }

    #[test]
    fn snapshot_versions_parse_numerically() {
        assert_eq!(snapshot_file_name(2), "snapshot_0000000002.enc");
        assert_eq!(parse_snapshot_version("snapshot_0000000010.enc"), Some(10));
        assert_eq!(parse_snapshot_version("snapshot_11.enc"), Some(11));
        assert_eq!(parse_snapshot_version(".snapshot_0000000001.enc.abc.tmp"), None);
        assert_eq!(parse_snapshot_version("snapshot_-1.enc"), None);
        assert_eq!(parse_snapshot_version("events_202401.log"), None);
    }

    #[tokio::test]
    async fn latest_snapshot_is_selected_by_version_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        for version in [2, 10, 9] {
            store.save_snapshot("p1", &project_at(version), &cancel).await.unwrap();
        }
        let loaded: Project = store.load_snapshot("p1", &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.version, 10);
        assert_eq!(loaded.name, "Household v10");
    }

    #[tokio::test]
    async fn snapshots_are_encrypted_and_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        let err = store
            .save_snapshot("p1", &project_at(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::SnapshotExists { version: 1, .. }));

        let raw = std::fs::read(dir.path().join("projects/p1").join(snapshot_file_name(1))).unwrap();
        assert!(!raw.windows(9).any(|window| window == b"Household"));

        let leftovers = std::fs::read_dir(dir.path().join("projects/p1"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn traversal_ids_fail_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut project = project_at(1);
        project.id = "../escape".into();
        let err = store
            .save_snapshot("../escape", &project, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PathTraversal { .. }));
        let err = store.list_projects("a/b", &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::PathTraversal { field: "owner_id", .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn mismatched_aggregate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let err = store
            .save_snapshot("p2", &project_at(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AggregateMismatch { .. }));
    }

    #[tokio::test]
    async fn events_filter_by_base_version_and_sort_by_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        for base in [3, 1, 2] {
            store.append_event("p1", &event(base), &cancel).await.unwrap();
        }
        let all = store.load_events("p1", 0, &cancel).await.unwrap();
        let versions: Vec<u32> = all.iter().map(|event| event.result_version).collect();
        assert_eq!(versions, vec![2, 3, 4]);

        let recent = store.load_events("p1", 2, &cancel).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|event| event.base_version >= 2));

        assert!(store.load_events("ghost", 0, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_rotate_by_calendar_month() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut february = event(2);
        february.timestamp = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut january = event(1);
        january.timestamp = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
        store.append_event("p1", &february, &cancel).await.unwrap();
        store.append_event("p1", &january, &cancel).await.unwrap();

        let project_dir = dir.path().join("projects/p1");
        assert!(project_dir.join("events_202401.log").exists());
        assert!(project_dir.join("events_202402.log").exists());

        let events = store.load_events("p1", 0, &cancel).await.unwrap();
        assert_eq!(events[0].change_set_id, january.change_set_id);
        assert_eq!(events[1].change_set_id, february.change_set_id);
    }

    #[tokio::test]
    async fn invalid_events_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut skipped = event(1);
        skipped.result_version = 3;
        let err = store.append_event("p1", &skipped, &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidEvent(_)));

        let err = store.append_event("p2", &event(1), &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::AggregateMismatch { .. }));
    }

    #[tokio::test]
    async fn torn_final_record_is_skipped_then_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let first = event(1);
        store.append_event("p1", &first, &cancel).await.unwrap();
        let log = dir.path().join("projects/p1").join(event_log_name(&first));
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str("AAAA#torn");
        std::fs::write(&log, &content).unwrap();

        assert_eq!(store.load_events("p1", 0, &cancel).await.unwrap().len(), 1);

        let mut second = event(2);
        second.timestamp = first.timestamp;
        store.append_event("p1", &second, &cancel).await.unwrap();
        assert_eq!(store.load_events("p1", 0, &cancel).await.unwrap().len(), 2);
        assert!(!std::fs::read_to_string(&log).unwrap().contains("#torn"));
    }

    #[tokio::test]
    async fn unterminated_record_that_still_decodes_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let first = event(1);
        let mut second = event(2);
        second.timestamp = first.timestamp;
        store.append_event("p1", &first, &cancel).await.unwrap();
        store.append_event("p1", &second, &cancel).await.unwrap();

        let log = dir.path().join("projects/p1").join(event_log_name(&first));
        let content = std::fs::read_to_string(&log).unwrap();
        let (head, tail) = content.split_once('\n').unwrap();
        let tail = tail.trim_end();
        let cut = (tail.len() / 2) / 4 * 4;
        EncryptedEnvelope::decode_line(&tail[..cut]).expect("cut lands past the frame header");
        std::fs::write(&log, format!("{head}\n{}", &tail[..cut])).unwrap();

        let events = store.load_events("p1", 0, &cancel).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_set_id, first.change_set_id);

        std::fs::write(&log, format!("{head}\n{}\n", &tail[..cut])).unwrap();
        let err = store.load_events("p1", 0, &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailure { .. }));
    }

    #[tokio::test]
    async fn corrupt_middle_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let first = event(1);
        store.append_event("p1", &first, &cancel).await.unwrap();
        let log = dir.path().join("projects/p1").join(event_log_name(&first));
        let record = std::fs::read_to_string(&log).unwrap();
        std::fs::write(&log, format!("{record}not-base64!\n{record}")).unwrap();

        let err = store.load_events("p1", 0, &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::MalformedEnvelope(_)));
    }

    #[tokio::test]
    async fn version_check_rejects_stale_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut missing = project_at(1);
        let outcome = store
            .try_update_with_version_check("p1", 1, &mut missing, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Conflict { expected: 1, actual: 0 });

        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        let mut first = project_at(1);
        first.name = "first".into();
        let outcome = store
            .try_update_with_version_check("p1", 1, &mut first, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { version: 2 });
        assert_eq!(first.version, 2);

        let mut stale = project_at(1);
        stale.name = "stale".into();
        let outcome = store
            .try_update_with_version_check("p1", 1, &mut stale, &cancel)
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.actual_version(), 2);
        assert_eq!(stale.version, 1);
        assert!(matches!(
            outcome.into_result("p1"),
            Err(VaultError::VersionConflict { expected: 1, actual: 2, .. })
        ));

        let stored: Project = store.load_snapshot("p1", &cancel).await.unwrap().unwrap();
        assert_eq!(stored.name, "first");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn commit_patch_writes_snapshot_and_event_together() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();
        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();

        let mut updated = project_at(1);
        updated.name = "v2".into();
        let outcome = store
            .try_commit_patch("p1", 1, &mut updated, &event(1), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { version: 2 });
        assert_eq!(store.load_events("p1", 0, &cancel).await.unwrap().len(), 1);

        let mut again = project_at(1);
        let outcome = store
            .try_commit_patch("p1", 1, &mut again, &event(1), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.actual_version(), 2);
        assert_eq!(store.load_events("p1", 0, &cancel).await.unwrap().len(), 1);

        let err = store
            .try_commit_patch("p1", 2, &mut again, &event(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn listing_follows_saves_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut second = Project::new("p2", "owner-1", "Second");
        second.description = Some("rental".into());
        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        store.save_snapshot("p2", &second, &cancel).await.unwrap();

        let listed = store.list_projects("owner-1", &cancel).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].description.as_deref(), Some("rental"));
        assert!(store.list_projects("nobody", &cancel).await.unwrap().is_empty());

        assert!(store.delete_project("p1", &cancel).await.unwrap());
        let listed = store.list_projects("owner-1", &cancel).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p2");
    }

    #[tokio::test]
    async fn soft_delete_keeps_a_decryptable_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        assert!(store.exists("p1", &cancel).await.unwrap());
        assert!(store.delete_project("p1", &cancel).await.unwrap());

        assert!(!store.exists("p1", &cancel).await.unwrap());
        assert!(store.load_snapshot::<Project>("p1", &cancel).await.unwrap().is_none());
        assert!(!store.delete_project("p1", &cancel).await.unwrap());

        let copies = store.deleted_copies("p1", &cancel).await.unwrap();
        assert_eq!(copies.len(), 1);
        let recovered: Project = store
            .load_snapshot_from(&copies[0], "p1", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.name, "Household v1");
        assert_eq!(recovered.version, 1);
    }

    #[tokio::test]
    async fn repeated_deletes_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        store.delete_project("p1", &cancel).await.unwrap();
        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        store.delete_project("p1", &cancel).await.unwrap();

        assert_eq!(store.deleted_copies("p1", &cancel).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleted_copies_ignore_longer_ids_sharing_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let mut lookalike = project_at(1);
        lookalike.id = "p1.deleted".into();
        store.save_snapshot("p1", &project_at(1), &cancel).await.unwrap();
        store.save_snapshot("p1.deleted", &lookalike, &cancel).await.unwrap();
        store.delete_project("p1", &cancel).await.unwrap();
        store.delete_project("p1.deleted", &cancel).await.unwrap();

        let copies = store.deleted_copies("p1", &cancel).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(store.deleted_copies("p1.deleted", &cancel).await.unwrap().len(), 1);

        assert!(is_deleted_copy_of("p1.deleted.1700000000", "p1"));
        assert!(is_deleted_copy_of("p1.deleted.1700000000-2", "p1"));
        assert!(!is_deleted_copy_of("p1.deleted.deleted.1700000000", "p1"));
        assert!(!is_deleted_copy_of("p1.deleted.1700000000-", "p1"));
        assert!(!is_deleted_copy_of("p10.deleted.1700000000", "p1"));
    }

    #[tokio::test]
    async fn key_provisioning_runs_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();

        let key = store.generate_key("p1", "owner-1", &cancel).await.unwrap();
        assert_eq!(key.version, 1);
        let err = store.generate_key("p1", "owner-1", &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::KeyExists(_)));
        let err = store.generate_key("../p1", "owner-1", &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn cancelled_operations_do_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .save_snapshot("p1", &project_at(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
        assert!(!dir.path().join("projects").exists());
    }
}
