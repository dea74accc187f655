//! Filesystem-backed object store
//!
//! Layout under the root directory:
//! - `<container>/` one directory per container
//! - `<container>/<object>` object bytes (object names may contain `/`)
//! - `<container>/<object>.meta.json` user metadata sidecar
//! - `<container>/<object>.lease.json` lease sidecar
//! - `<container>/.container.lease.json` container lease
//! - `<lease file>.claim` held while an expired lease is being taken over
//!
//! Lease files are written in full to a temp file and published with a
//! hard link, which fails when the target exists. Readers never see a
//! partially written lease.

use super::object_store::{
    check_write_lease, slot_state, validate_object_name, LeaseDuration, LeaseSlot, LeaseState,
    ObjectStore, ResourceKey, StoreError, StoreResult, MAX_LEASE_SECS,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const META_SUFFIX: &str = ".meta.json";
const LEASE_SUFFIX: &str = ".lease.json";
const TMP_SUFFIX: &str = ".tmp";
const CLAIM_SUFFIX: &str = ".claim";
const CONTAINER_LEASE_FILE: &str = ".container.lease.json";

fn io_err(context: impl std::fmt::Display, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", context, e))
}

/// Filesystem [`ObjectStore`]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| io_err(format!("Failed to create store root {}", root.display()), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_path(&self, container: &str) -> StoreResult<PathBuf> {
        if container.is_empty() || container.contains('/') || container.starts_with('.') {
            return Err(StoreError::InvalidName(container.to_string()));
        }
        Ok(self.root.join(container))
    }

    fn existing_container(&self, container: &str) -> StoreResult<PathBuf> {
        let path = self.container_path(container)?;
        if !path.is_dir() {
            return Err(StoreError::ContainerNotFound(container.to_string()));
        }
        Ok(path)
    }

    fn object_path(&self, container: &str, object: &str) -> StoreResult<PathBuf> {
        validate_object_name(object)?;
        if is_internal(object) {
            return Err(StoreError::InvalidName(object.to_string()));
        }
        Ok(self.existing_container(container)?.join(object))
    }

    fn existing_object(&self, container: &str, object: &str) -> StoreResult<PathBuf> {
        let path = self.object_path(container, object)?;
        if !path.is_file() {
            return Err(StoreError::not_found(container, object));
        }
        Ok(path)
    }

    fn lease_path(&self, resource: &ResourceKey) -> StoreResult<PathBuf> {
        match &resource.object {
            None => Ok(self
                .existing_container(&resource.container)?
                .join(CONTAINER_LEASE_FILE)),
            Some(object) => Ok(sidecar(
                &self.existing_object(&resource.container, object)?,
                LEASE_SUFFIX,
            )),
        }
    }
}

fn is_internal(name: &str) -> bool {
    name.ends_with(META_SUFFIX)
        || name.ends_with(LEASE_SUFFIX)
        || name.ends_with(TMP_SUFFIX)
        || name.ends_with(CLAIM_SUFFIX)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `data` to a fresh temp file next to `path` and return the temp path
fn write_temp(path: &Path, data: &[u8]) -> StoreResult<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidName(path.display().to_string()))?;
    fs::create_dir_all(parent)
        .map_err(|e| io_err(format!("Failed to create directory {}", parent.display()), e))?;

    let temp_path = sidecar(path, &format!(".{}{}", uuid::Uuid::new_v4(), TMP_SUFFIX));
    let written = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(format!("Failed to write {}", temp_path.display()), e));
    }
    Ok(temp_path)
}

/// Write to a temporary file then rename over the target
fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let temp_path = write_temp(path, data)?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        io_err(
            format!(
                "Failed to rename {} -> {}",
                temp_path.display(),
                path.display()
            ),
            e,
        )
    })
}

/// Hard-link `source` to `target`; `Ok(false)` when `target` already exists
fn link_new(source: &Path, target: &Path) -> StoreResult<bool> {
    match fs::hard_link(source, target) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(io_err(
            format!("Failed to link {} -> {}", source.display(), target.display()),
            e,
        )),
    }
}

fn modified_before(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |elapsed| elapsed > age)
}

/// Read a lease file
///
/// A file that does not parse is reported as a present lease so that
/// acquirers back off instead of failing.
fn read_lease(path: &Path, resource: &str) -> StoreResult<Option<LeaseSlot>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            debug!("Unreadable lease file {}: {}", path.display(), e);
            StoreError::LeaseAlreadyPresent(resource.to_string())
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(format!("Failed to read lease {}", path.display()), e)),
    }
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(format!("Failed to remove {}", path.display()), e)),
    }
}

fn collect_objects(dir: &Path, base: &Path, out: &mut Vec<String>) -> StoreResult<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| io_err(format!("Failed to read directory {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err("Failed to read directory entry", e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_objects(&path, base, out)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if !is_internal(&name) {
            out.push(name);
        }
    }
    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn container_exists(&self, container: &str) -> StoreResult<bool> {
        Ok(self.container_path(container)?.is_dir())
    }

    fn create_container(&self, container: &str) -> StoreResult<()> {
        let path = self.container_path(container)?;
        match fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(container.to_string()))
            }
            Err(e) => Err(io_err(format!("Failed to create container {}", container), e)),
        }
    }

    fn exists(&self, container: &str, object: &str) -> StoreResult<bool> {
        if !self.container_path(container)?.is_dir() {
            return Ok(false);
        }
        Ok(self.object_path(container, object)?.is_file())
    }

    fn read(&self, container: &str, object: &str) -> StoreResult<Vec<u8>> {
        let path = self.object_path(container, object)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::not_found(container, object),
            _ => io_err(format!("Failed to read {}", path.display()), e),
        })
    }

    fn upload(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        overwrite: bool,
        lease_id: Option<&str>,
    ) -> StoreResult<()> {
        let path = self.object_path(container, object)?;
        let name = format!("{}/{}", container, object);
        if path.is_file() {
            if !overwrite {
                return Err(StoreError::AlreadyExists(name));
            }
            let lease = read_lease(&sidecar(&path, LEASE_SUFFIX), &name)?;
            check_write_lease(lease.as_ref(), lease_id, &name, Utc::now())?;
        } else if lease_id.is_some() {
            return Err(StoreError::LeaseNotPresent(name));
        }
        write_atomic(&path, data)
    }

    fn delete(&self, container: &str, object: &str, lease_id: Option<&str>) -> StoreResult<()> {
        let path = self.existing_object(container, object)?;
        let name = format!("{}/{}", container, object);
        let lease_path = sidecar(&path, LEASE_SUFFIX);
        let lease = read_lease(&lease_path, &name)?;
        check_write_lease(lease.as_ref(), lease_id, &name, Utc::now())?;
        fs::remove_file(&path)
            .map_err(|e| io_err(format!("Failed to delete {}", path.display()), e))?;
        remove_if_exists(&sidecar(&path, META_SUFFIX))?;
        remove_if_exists(&lease_path)
    }

    fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let base = self.existing_container(container)?;
        let mut names = Vec::new();
        collect_objects(&base, &base, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    fn get_metadata(&self, container: &str, object: &str) -> StoreResult<HashMap<String, String>> {
        let path = self.existing_object(container, object)?;
        let meta_path = sidecar(&path, META_SUFFIX);
        match fs::read(&meta_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Backend(format!("corrupt metadata {}: {}", meta_path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(io_err(format!("Failed to read {}", meta_path.display()), e)),
        }
    }

    fn set_metadata(
        &self,
        container: &str,
        object: &str,
        metadata: HashMap<String, String>,
        lease_id: Option<&str>,
    ) -> StoreResult<()> {
        let path = self.existing_object(container, object)?;
        let name = format!("{}/{}", container, object);
        let lease = read_lease(&sidecar(&path, LEASE_SUFFIX), &name)?;
        check_write_lease(lease.as_ref(), lease_id, &name, Utc::now())?;
        let bytes = serde_json::to_vec(&metadata)
            .map_err(|e| StoreError::Backend(format!("Failed to encode metadata: {}", e)))?;
        write_atomic(&sidecar(&path, META_SUFFIX), &bytes)
    }

    fn acquire_lease(&self, resource: &ResourceKey, duration: LeaseDuration) -> StoreResult<String> {
        let path = self.lease_path(resource)?;
        let slot = LeaseSlot::grant(duration, Utc::now());
        let bytes = serde_json::to_vec(&slot)
            .map_err(|e| StoreError::Backend(format!("Failed to encode lease: {}", e)))?;
        let temp_path = write_temp(&path, &bytes)?;
        let granted = publish_lease(&path, &temp_path, &slot, &resource.to_string());
        let _ = fs::remove_file(&temp_path);
        granted.map(|()| slot.lease_id)
    }

    fn release_lease(&self, resource: &ResourceKey, lease_id: &str) -> StoreResult<()> {
        let name = resource.to_string();
        let path = self.lease_path(resource)?;
        match read_lease(&path, &name)? {
            None => Err(StoreError::LeaseNotPresent(name)),
            Some(existing) if existing.lease_id == lease_id => {
                // an expired file may be mid-takeover; leave it to the claimant
                if existing.is_active(Utc::now()) {
                    remove_if_exists(&path)?;
                }
                Ok(())
            }
            Some(existing) if !existing.is_active(Utc::now()) => {
                Err(StoreError::LeaseNotPresent(name))
            }
            Some(_) => Err(StoreError::LeaseIdMismatch(name)),
        }
    }

    fn lease_state(&self, resource: &ResourceKey) -> StoreResult<LeaseState> {
        let path = self.lease_path(resource)?;
        let lease = read_lease(&path, &resource.to_string())?;
        Ok(slot_state(lease.as_ref(), Utc::now()))
    }
}

/// Install the lease written at `temp_path` as the lease file at `path`
///
/// A free resource is taken with a single no-clobber link. An expired lease
/// is only overwritten by the holder of the claim file, and ownership is
/// confirmed by reading the lease back.
fn publish_lease(path: &Path, temp_path: &Path, slot: &LeaseSlot, resource: &str) -> StoreResult<()> {
    if link_new(temp_path, path)? {
        return Ok(());
    }

    let now = Utc::now();
    let expired = match read_lease(path, resource)? {
        // released in between; the caller retries
        None => return Err(StoreError::LeaseAlreadyPresent(resource.to_string())),
        Some(existing) if existing.is_active(now) => {
            return Err(StoreError::LeaseAlreadyPresent(resource.to_string()))
        }
        Some(existing) => existing,
    };

    let claim = sidecar(path, CLAIM_SUFFIX);
    if !link_new(temp_path, &claim)? {
        // a claimant that died mid-takeover leaves its claim behind
        if modified_before(&claim, Duration::from_secs(MAX_LEASE_SECS as u64)) {
            warn!("Removing stale lease claim {}", claim.display());
            remove_if_exists(&claim)?;
        }
        return Err(StoreError::LeaseAlreadyPresent(resource.to_string()));
    }

    let taken = take_over(path, temp_path, &expired, slot, resource, now);
    let _ = fs::remove_file(&claim);
    taken
}

fn take_over(
    path: &Path,
    temp_path: &Path,
    expired: &LeaseSlot,
    slot: &LeaseSlot,
    resource: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    match read_lease(path, resource)? {
        Some(current) if current.lease_id == expired.lease_id && !current.is_active(now) => {
            fs::rename(temp_path, path).map_err(|e| {
                io_err(format!("Failed to replace lease {}", path.display()), e)
            })?;
        }
        None => {
            if !link_new(temp_path, path)? {
                return Err(StoreError::LeaseAlreadyPresent(resource.to_string()));
            }
        }
        Some(_) => return Err(StoreError::LeaseAlreadyPresent(resource.to_string())),
    }

    match read_lease(path, resource)? {
        Some(current) if current.lease_id == slot.lease_id => {
            debug!("Took over expired lease {} on {}", expired.lease_id, resource);
            Ok(())
        }
        _ => Err(StoreError::LeaseAlreadyPresent(resource.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsObjectStore) {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path().join("store")).unwrap();
        store.create_container("db").unwrap();
        (temp, store)
    }

    #[test]
    fn test_nested_objects_and_listing() {
        let (_temp, store) = store();
        store
            .upload("db", "mapping/chunk_index_mapping.json", b"{}", true, None)
            .unwrap();
        store.upload("db", "chunks/chunk_0.json", b"{}", true, None).unwrap();
        store
            .set_metadata(
                "db",
                "chunks/chunk_0.json",
                HashMap::from([("k".to_string(), "v".to_string())]),
                None,
            )
            .unwrap();

        let all = store.list("db", "").unwrap();
        assert_eq!(
            all,
            vec!["chunks/chunk_0.json", "mapping/chunk_index_mapping.json"]
        );
        assert_eq!(
            store.get_metadata("db", "chunks/chunk_0.json").unwrap()["k"],
            "v"
        );
    }

    #[test]
    fn test_create_container_twice() {
        let (_temp, store) = store();
        assert!(matches!(
            store.create_container("db"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_object_lease_roundtrip() {
        let (_temp, store) = store();
        store.upload("db", "index.bin", b"v1", true, None).unwrap();
        let key = ResourceKey::object("db", "index.bin");

        let lease_id = store.acquire_lease(&key, LeaseDuration::Fixed(15)).unwrap();
        assert!(matches!(
            store.acquire_lease(&key, LeaseDuration::Fixed(15)),
            Err(StoreError::LeaseAlreadyPresent(_))
        ));
        assert!(store.upload("db", "index.bin", b"v2", true, None).is_err());
        store
            .upload("db", "index.bin", b"v2", true, Some(&lease_id))
            .unwrap();
        assert!(matches!(
            store.release_lease(&key, "not-mine"),
            Err(StoreError::LeaseIdMismatch(_))
        ));
        store.release_lease(&key, &lease_id).unwrap();

        assert_eq!(store.read("db", "index.bin").unwrap(), b"v2");
        assert_eq!(store.lease_state(&key).unwrap(), LeaseState::Available);
        // lease sidecars never show up as objects
        assert_eq!(store.list("db", "").unwrap(), vec!["index.bin"]);
    }

    #[test]
    fn test_container_lease() {
        let (_temp, store) = store();
        let key = ResourceKey::container("db");
        let lease_id = store.acquire_lease(&key, LeaseDuration::Infinite).unwrap();
        assert!(store.lease_state(&key).unwrap().is_leased());
        store.release_lease(&key, &lease_id).unwrap();
        assert!(!store.lease_state(&key).unwrap().is_leased());
    }

    #[test]
    fn test_missing_object() {
        let (_temp, store) = store();
        assert!(store.read("db", "nope").unwrap_err().is_not_found());
        assert!(store.read("other", "nope").unwrap_err().is_not_found());
        assert!(!store.exists("other", "nope").unwrap());
    }

    fn write_expired_lease(store: &FsObjectStore, container: &str, object: &str) -> String {
        let expired = LeaseSlot {
            lease_id: "expired-holder".to_string(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
        };
        let path = sidecar(&store.root().join(container).join(object), LEASE_SUFFIX);
        fs::write(&path, serde_json::to_vec(&expired).unwrap()).unwrap();
        expired.lease_id
    }

    #[test]
    fn test_unreadable_lease_file_counts_as_leased() {
        let (_temp, store) = store();
        store.upload("db", "map.json", b"{}", true, None).unwrap();
        let lease_path = sidecar(&store.root().join("db").join("map.json"), LEASE_SUFFIX);

        for contents in [&b""[..], &b"{\"lease_id\": \"ab"[..]] {
            fs::write(&lease_path, contents).unwrap();
            let key = ResourceKey::object("db", "map.json");
            assert!(matches!(
                store.acquire_lease(&key, LeaseDuration::Fixed(15)),
                Err(StoreError::LeaseAlreadyPresent(_))
            ));
        }
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let (_temp, store) = store();
        store.upload("db", "map.json", b"v1", true, None).unwrap();
        let stale_id = write_expired_lease(&store, "db", "map.json");
        let key = ResourceKey::object("db", "map.json");

        let lease_id = store.acquire_lease(&key, LeaseDuration::Fixed(15)).unwrap();
        assert_ne!(lease_id, stale_id);
        assert!(matches!(
            store.lease_state(&key).unwrap(),
            LeaseState::Leased { lease_id: ref held, .. } if *held == lease_id
        ));

        // the previous holder can no longer write or release
        assert!(matches!(
            store.upload("db", "map.json", b"stale", true, Some(&stale_id)),
            Err(StoreError::LeaseIdMismatch(_))
        ));
        assert!(store.release_lease(&key, &stale_id).is_err());
        assert!(store.lease_state(&key).unwrap().is_leased());

        store.release_lease(&key, &lease_id).unwrap();
        assert_eq!(store.read("db", "map.json").unwrap(), b"v1");
        // no temp or claim files linger next to the object
        assert_eq!(
            fs::read_dir(store.root().join("db")).unwrap().count(),
            1,
            "only map.json should remain"
        );
    }

    #[test]
    fn test_takeover_waits_for_live_claim() {
        let (_temp, store) = store();
        store.upload("db", "map.json", b"{}", true, None).unwrap();
        write_expired_lease(&store, "db", "map.json");
        let lease_path = sidecar(&store.root().join("db").join("map.json"), LEASE_SUFFIX);
        let claim = sidecar(&lease_path, CLAIM_SUFFIX);
        fs::write(&claim, b"{}").unwrap();

        let key = ResourceKey::object("db", "map.json");
        assert!(matches!(
            store.acquire_lease(&key, LeaseDuration::Fixed(15)),
            Err(StoreError::LeaseAlreadyPresent(_))
        ));
        assert!(claim.exists());

        fs::remove_file(&claim).unwrap();
        assert!(store.acquire_lease(&key, LeaseDuration::Fixed(15)).is_ok());
    }
}
