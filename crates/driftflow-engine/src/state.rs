//! State management for managed resources
//!
//! Manages the `.driftflow/state.json` file which records the last applied
//! state of every resource, and `.driftflow/lock.json`, the advisory lease
//! that serializes apply runs against one state directory.

use crate::error::{EngineError, Result};
use crate::resource::{Attributes, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".driftflow";
const STATE_FILE: &str = "state.json";
const STATE_TMP: &str = "state.json.tmp";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

static LOCK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Every record known to a state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State file format version
    pub version: u32,

    /// Incremented on every save
    pub serial: u64,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Records indexed by `type.name`
    pub records: BTreeMap<ResourceId, StateRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            updated_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    /// Records currently marked as tainted
    pub fn tainted(&self) -> Vec<&ResourceId> {
        self.records
            .values()
            .filter(|r| r.tainted)
            .map(|r| &r.id)
            .collect()
    }
}

/// Last applied state of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: ResourceId,

    /// Provider tag that manages the resource
    pub provider: String,

    /// Applied attributes merged with provider outputs
    pub attributes: Attributes,

    /// Attributes that came from the declaration rather than the provider
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub declared: BTreeSet<String>,

    /// Resources this one depended on when it was last applied
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,

    /// Bumped on every successful write
    pub version: u64,

    /// Set when an operation on the resource failed mid-apply
    #[serde(default)]
    pub tainted: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(id: ResourceId, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider: provider.into(),
            attributes: Attributes::new(),
            declared: BTreeSet::new(),
            dependencies: Vec::new(),
            version: 0,
            tainted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_declared<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.declared = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = ResourceId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn tainted(mut self) -> Self {
        self.tainted = true;
        self
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Lock information as persisted in `lock.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Proof of lock ownership handed to mutating state calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    holder: String,
    token: String,
}

impl LockToken {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// State store backed by a directory on disk
///
/// All mutating calls run a read-modify-write of the state file under an
/// in-process mutex; the lease in `lock.json` keeps other processes out.
pub struct StateStore {
    dir: PathBuf,
    io: Mutex<()>,
}

impl StateStore {
    /// Store rooted at an explicit state directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            io: Mutex::new(()),
        }
    }

    /// Store at `<project_root>/.driftflow`
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        Self::new(project_root.as_ref().join(STATE_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(STATE_TMP)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }
        Ok(())
    }

    async fn load(&self) -> Result<StateSnapshot> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("State file not found, returning empty state");
                return Ok(StateSnapshot::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content)?;
        if snapshot.version > STATE_VERSION {
            return Err(EngineError::StateError(format!(
                "State file version {} is newer than supported version {}",
                snapshot.version, STATE_VERSION
            )));
        }

        Ok(snapshot)
    }

    async fn save(&self, snapshot: &mut StateSnapshot) -> Result<()> {
        self.ensure_state_dir().await?;

        snapshot.serial += 1;
        snapshot.updated_at = Utc::now();

        let path = self.state_path();
        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }

        // Write-then-rename so readers never observe a torn file
        let tmp = self.tmp_path();
        let content = serde_json::to_string_pretty(snapshot)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        tracing::debug!(
            "Saved state serial {} with {} records",
            snapshot.serial,
            snapshot.records.len()
        );
        Ok(())
    }

    /// Copy of every stored record
    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let _guard = self.io.lock().await;
        self.load().await
    }

    pub async fn read(&self, id: &ResourceId) -> Result<StateRecord> {
        let _guard = self.io.lock().await;
        self.load()
            .await?
            .records
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    /// Store `record`, returning its new version
    ///
    /// `expected_version` is the version the caller based its change on;
    /// `None` means the caller expects no record to exist yet.
    pub async fn write(
        &self,
        lock: &LockToken,
        mut record: StateRecord,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let _guard = self.io.lock().await;
        self.verify_lock(lock).await?;

        let mut snapshot = self.load().await?;
        let existing = snapshot.records.get(&record.id);
        let found = existing.map(|r| r.version);
        if found != expected_version {
            return Err(EngineError::VersionConflict {
                id: record.id.clone(),
                expected: expected_version,
                found,
            });
        }

        if let Some(existing) = existing {
            record.created_at = existing.created_at;
        }
        record.version = found.unwrap_or(0) + 1;
        record.updated_at = Utc::now();
        let version = record.version;

        tracing::debug!("Writing {} at version {}", record.id, version);
        snapshot.records.insert(record.id.clone(), record);
        self.save(&mut snapshot).await?;
        Ok(version)
    }

    /// Remove a record; removing an absent record succeeds
    pub async fn delete(&self, lock: &LockToken, id: &ResourceId) -> Result<bool> {
        let _guard = self.io.lock().await;
        self.verify_lock(lock).await?;

        let mut snapshot = self.load().await?;
        if snapshot.records.remove(id).is_none() {
            tracing::debug!("{} already absent from state", id);
            return Ok(false);
        }
        self.save(&mut snapshot).await?;
        tracing::debug!("Removed {} from state", id);
        Ok(true)
    }

    /// Mark a resource as tainted, merging whatever partial attributes are known
    ///
    /// A record is created when none exists, so a half-created remote object
    /// stays visible to the operator.
    pub async fn taint(
        &self,
        lock: &LockToken,
        id: &ResourceId,
        provider: &str,
        partial: Option<Attributes>,
    ) -> Result<u64> {
        let _guard = self.io.lock().await;
        self.verify_lock(lock).await?;

        let mut snapshot = self.load().await?;
        let now = Utc::now();
        let record = snapshot
            .records
            .entry(id.clone())
            .or_insert_with(|| StateRecord::new(id.clone(), provider));
        if let Some(partial) = partial {
            record.attributes.extend(partial);
        }
        record.tainted = true;
        record.version += 1;
        record.updated_at = now;
        let version = record.version;

        self.save(&mut snapshot).await?;
        tracing::warn!("Marked {} as tainted", id);
        Ok(version)
    }

    /// Take the advisory lock for `holder`, failing with `LockHeld` while
    /// another holder's lease is still valid
    pub async fn acquire_lock(&self, holder: &str, lease: Duration) -> Result<StateLock> {
        let _guard = self.io.lock().await;
        self.ensure_state_dir().await?;

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| EngineError::StateError(format!("Invalid lease duration: {}", e)))?;
        let lock_path = self.lock_path();

        // Second round only after an expired lease was moved aside
        for _ in 0..2 {
            let acquired_at = Utc::now();
            let info = LockInfo {
                holder: holder.to_string(),
                token: new_token(),
                acquired_at,
                expires_at: acquired_at + lease,
            };

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let content = serde_json::to_string_pretty(&info)?;
                    file.write_all(content.as_bytes()).await?;
                    file.sync_all().await?;

                    tracing::debug!("Acquired state lock for {}", holder);
                    return Ok(StateLock {
                        lock_path,
                        info,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let current = self.read_lock().await?;
                    match current {
                        Some(current) if !current.is_expired() => {
                            return Err(EngineError::LockHeld {
                                holder: current.holder,
                                acquired_at: current.acquired_at,
                                expires_at: current.expires_at,
                            });
                        }
                        Some(current) => {
                            tracing::warn!(
                                "Taking over expired lock from {} (expired {})",
                                current.holder,
                                current.expires_at
                            );
                            self.move_aside_stale(&current).await?;
                        }
                        // Vanished between open and read
                        None => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::StateError(
            "Could not acquire state lock after removing a stale lease".to_string(),
        ))
    }

    /// Current lock holder, if any (including expired leases)
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    /// Remove the lock regardless of holder
    pub async fn force_unlock(&self) -> Result<bool> {
        let _guard = self.io.lock().await;
        match self.read_lock().await? {
            Some(info) => {
                tracing::warn!("Force-unlocking state held by {}", info.holder);
                remove_if_exists(&self.lock_path()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(self.lock_path()).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(info) => Ok(Some(info)),
                // Half-written lock from a crashed holder: treat as expired
                Err(e) => {
                    tracing::warn!("Unreadable lock file ({}), treating it as expired", e);
                    Ok(Some(LockInfo {
                        holder: "unknown".to_string(),
                        token: String::new(),
                        acquired_at: DateTime::<Utc>::MIN_UTC,
                        expires_at: DateTime::<Utc>::MIN_UTC,
                    }))
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an expired lock out of the way without clobbering a lease another
    /// process may have taken in the meantime
    async fn move_aside_stale(&self, stale: &LockInfo) -> Result<()> {
        let lock_path = self.lock_path();
        let aside = self.dir.join(format!("{}.stale-{}", LOCK_FILE, new_token()));
        match fs::rename(&lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved: Option<LockInfo> = fs::read_to_string(&aside)
            .await
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok());
        match moved {
            Some(moved) if moved.token != stale.token && !moved.is_expired() => {
                // Someone else won the takeover race; hand their lease back
                fs::rename(&aside, &lock_path).await?;
                Err(EngineError::LockHeld {
                    holder: moved.holder,
                    acquired_at: moved.acquired_at,
                    expires_at: moved.expires_at,
                })
            }
            _ => {
                remove_if_exists(&aside).await?;
                Ok(())
            }
        }
    }

    async fn verify_lock(&self, lock: &LockToken) -> Result<()> {
        match self.read_lock().await? {
            Some(info) if info.token == lock.token && !info.is_expired() => Ok(()),
            _ => Err(EngineError::LockLost(lock.holder.clone())),
        }
    }
}

/// RAII guard for the state lock
#[derive(Debug)]
pub struct StateLock {
    lock_path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl StateLock {
    pub fn holder(&self) -> &str {
        &self.info.holder
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn token(&self) -> LockToken {
        LockToken {
            holder: self.info.holder.clone(),
            token: self.info.token.clone(),
        }
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if owns_lock_file(&self.lock_path, &self.info.token) {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock for {}", self.info.holder);
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && owns_lock_file(&self.lock_path, &self.info.token) {
            // Synchronous cleanup in drop - not ideal but necessary
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

fn owns_lock_file(path: &Path, token: &str) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
        .is_some_and(|info| info.token == token)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn new_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = LOCK_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{:x}", std::process::id(), nanos, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    const LEASE: Duration = Duration::from_secs(60);

    fn storage_id() -> ResourceId {
        ResourceId::new("storage_account", "logs")
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_bumps_version() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();

        let record = StateRecord::new(storage_id(), "local")
            .with_attribute("id", json!("sa-001"))
            .with_attribute("location", json!("westeurope"));
        let v1 = assert_ok!(store.write(&lock.token(), record, None).await);
        assert_eq!(v1, 1);

        let mut stored = assert_ok!(store.read(&storage_id()).await);
        assert_eq!(stored.version, 1);
        assert_eq!(
            stored.get_attribute::<String>("location").as_deref(),
            Some("westeurope")
        );

        stored.attributes.insert("location".into(), json!("northeurope"));
        let v2 = assert_ok!(store.write(&lock.token(), stored, Some(1)).await);
        assert_eq!(v2, 2);

        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_declared_keys_persist_and_default_when_absent() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();

        let record = StateRecord::new(storage_id(), "local")
            .with_attribute("location", json!("westeurope"))
            .with_attribute("id", json!("sa-001"))
            .with_declared(["location"]);
        assert_ok!(store.write(&lock.token(), record, None).await);

        let stored = assert_ok!(store.read(&storage_id()).await);
        assert_eq!(stored.declared, BTreeSet::from(["location".to_string()]));

        // Records written without the field still load
        let legacy: StateRecord = serde_json::from_value(json!({
            "id": "storage_account.old",
            "provider": "local",
            "attributes": {},
            "version": 1,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(legacy.declared.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_new_store_instance() {
        let temp_dir = tempdir().unwrap();
        {
            let store = StateStore::for_project(temp_dir.path());
            let lock = store.acquire_lock("test", LEASE).await.unwrap();
            store
                .write(&lock.token(), StateRecord::new(storage_id(), "local"), None)
                .await
                .unwrap();
            lock.release().await.unwrap();
        }

        let reopened = StateStore::for_project(temp_dir.path());
        let snapshot = reopened.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&storage_id()).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());

        let err = store.read(&storage_id()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == storage_id()));
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();
        let token = lock.token();

        store
            .write(&token, StateRecord::new(storage_id(), "local"), None)
            .await
            .unwrap();

        let err = store
            .write(&token, StateRecord::new(storage_id(), "local"), None)
            .await
            .unwrap_err();
        match err {
            EngineError::VersionConflict {
                expected, found, ..
            } => {
                assert_eq!(expected, None);
                assert_eq!(found, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_write_requires_current_lock() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();
        let token = lock.token();
        lock.release().await.unwrap();

        let err = assert_err!(
            store
                .write(&token, StateRecord::new(storage_id(), "local"), None)
                .await
        );
        assert!(matches!(err, EngineError::LockLost(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();
        let token = lock.token();

        store
            .write(&token, StateRecord::new(storage_id(), "local"), None)
            .await
            .unwrap();
        assert!(store.delete(&token, &storage_id()).await.unwrap());
        assert!(!store.delete(&token, &storage_id()).await.unwrap());
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_taint_creates_or_marks_record() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("test", LEASE).await.unwrap();
        let token = lock.token();

        let partial = Attributes::from([("id".to_string(), json!("sa-half"))]);
        store
            .taint(&token, &storage_id(), "local", Some(partial))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let record = snapshot.get(&storage_id()).unwrap();
        assert!(record.tainted);
        assert_eq!(record.attributes["id"], json!("sa-half"));
        assert_eq!(snapshot.tainted(), vec![&storage_id()]);
    }

    #[tokio::test]
    async fn test_lock_held_by_other_holder() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let first = store.acquire_lock("first", LEASE).await.unwrap();

        let err = store.acquire_lock("second", LEASE).await.unwrap_err();
        assert!(matches!(err, EngineError::LockHeld { ref holder, .. } if holder == "first"));

        first.release().await.unwrap();
        let second = store.acquire_lock("second", LEASE).await.unwrap();
        assert_eq!(second.holder(), "second");
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let crashed = store
            .acquire_lock("crashed", Duration::from_millis(1))
            .await
            .unwrap();
        // Simulate a crashed holder: the guard never runs its cleanup
        std::mem::forget(crashed);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lock = store.acquire_lock("recovery", LEASE).await.unwrap();
        assert_eq!(lock.holder(), "recovery");
        assert_eq!(
            store.lock_info().await.unwrap().unwrap().holder,
            "recovery"
        );
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        {
            let _lock = store.acquire_lock("scoped", LEASE).await.unwrap();
            assert!(store.lock_info().await.unwrap().is_some());
        }
        assert!(store.lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        let lock = store.acquire_lock("stuck", LEASE).await.unwrap();
        std::mem::forget(lock);

        assert!(store.force_unlock().await.unwrap());
        assert!(!store.force_unlock().await.unwrap());
        store.acquire_lock("next", LEASE).await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_state_version_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_project(temp_dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        let snapshot = StateSnapshot {
            version: STATE_VERSION + 1,
            ..StateSnapshot::default()
        };
        std::fs::write(
            store.dir().join(STATE_FILE),
            serde_json::to_string(&snapshot).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            store.snapshot().await.unwrap_err(),
            EngineError::StateError(_)
        ));
    }
}
