//! Object store interface shared by every storage backend
//!
//! The lease primitives here mirror what a cloud blob store offers natively:
//! a lease is an exclusive, time-bounded claim on one container or object, and
//! a leased object rejects writes that do not present the lease id.

use crate::error::{BlobdexError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Sentinel accepted by [`LeaseDuration::from_secs`] for a lease that never expires
pub const INFINITE_LEASE_SECS: i64 = -1;

/// Shortest fixed lease the store grants, in seconds
pub const MIN_LEASE_SECS: i64 = 15;

/// Longest fixed lease the store grants, in seconds
pub const MAX_LEASE_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {container}/{object}")]
    NotFound { container: String, object: String },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container is being deleted: {0}")]
    ContainerBeingDeleted(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("there is already a lease present on {0}")]
    LeaseAlreadyPresent(String),

    #[error("lease id does not match the active lease on {0}")]
    LeaseIdMismatch(String),

    #[error("{0} is leased and no lease id was specified")]
    LeaseIdMissing(String),

    #[error("there is no lease on {0}")]
    LeaseNotPresent(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::ContainerNotFound(_)
        )
    }

    pub(crate) fn not_found(container: &str, object: &str) -> Self {
        StoreError::NotFound {
            container: container.to_string(),
            object: object.to_string(),
        }
    }
}

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A leasable resource: a whole container or one object inside it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub container: String,
    pub object: Option<String>,
}

impl ResourceKey {
    pub fn container(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            object: None,
        }
    }

    pub fn object(container: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            object: Some(object.into()),
        }
    }

    /// Parse `container` or `container/object` (the object part may contain further slashes)
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once('/') {
            Some((container, object)) if !container.is_empty() && !object.is_empty() => {
                Ok(Self::object(container, object))
            }
            None if !key.is_empty() => Ok(Self::container(key)),
            _ => Err(BlobdexError::Validation(format!(
                "invalid resource key: '{}'",
                key
            ))),
        }
    }

    pub fn is_container(&self) -> bool {
        self.object.is_none()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(object) => write!(f, "{}/{}", self.container, object),
            None => write!(f, "{}", self.container),
        }
    }
}

/// How long an acquired lease stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseDuration {
    Fixed(u32),
    Infinite,
}

impl LeaseDuration {
    /// Validate a duration in seconds: 15..=60, or -1 for an indefinite lease
    pub fn from_secs(secs: i64) -> Result<Self> {
        if secs == INFINITE_LEASE_SECS {
            return Ok(LeaseDuration::Infinite);
        }
        if (MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&secs) {
            // range check above keeps this lossless
            return Ok(LeaseDuration::Fixed(secs as u32));
        }
        Err(BlobdexError::Validation(format!(
            "lease duration must be between {} and {} seconds or {}, got {}",
            MIN_LEASE_SECS, MAX_LEASE_SECS, INFINITE_LEASE_SECS, secs
        )))
    }

    pub fn as_secs(&self) -> i64 {
        match self {
            LeaseDuration::Fixed(secs) => i64::from(*secs),
            LeaseDuration::Infinite => INFINITE_LEASE_SECS,
        }
    }

    /// Expiry instant for a lease granted at `now`, `None` when it never expires
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            LeaseDuration::Fixed(secs) => Some(now + ChronoDuration::seconds(i64::from(*secs))),
            LeaseDuration::Infinite => None,
        }
    }
}

impl Default for LeaseDuration {
    fn default() -> Self {
        LeaseDuration::Fixed(20)
    }
}

/// Lease status of a resource as reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Available,
    Leased {
        lease_id: String,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl LeaseState {
    pub fn is_leased(&self) -> bool {
        matches!(self, LeaseState::Leased { .. })
    }
}

/// Stored lease record; both backends persist it in this shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseSlot {
    pub lease_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseSlot {
    pub fn grant(duration: LeaseDuration, now: DateTime<Utc>) -> Self {
        Self {
            lease_id: uuid::Uuid::new_v4().to_string(),
            expires_at: duration.expires_at(now),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Lease state of an optional slot, treating expired leases as available
pub(crate) fn slot_state(slot: Option<&LeaseSlot>, now: DateTime<Utc>) -> LeaseState {
    match slot {
        Some(slot) if slot.is_active(now) => LeaseState::Leased {
            lease_id: slot.lease_id.clone(),
            expires_at: slot.expires_at,
        },
        _ => LeaseState::Available,
    }
}

/// Check a write against the lease currently held on the resource
pub(crate) fn check_write_lease(
    slot: Option<&LeaseSlot>,
    lease_id: Option<&str>,
    resource: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    match (slot_state(slot, now), lease_id) {
        (LeaseState::Available, None) => Ok(()),
        (LeaseState::Available, Some(_)) => Err(StoreError::LeaseNotPresent(resource.to_string())),
        (LeaseState::Leased { .. }, None) => Err(StoreError::LeaseIdMissing(resource.to_string())),
        (LeaseState::Leased { lease_id: held, .. }, Some(given)) if held == given => Ok(()),
        (LeaseState::Leased { .. }, Some(_)) => Err(StoreError::LeaseIdMismatch(resource.to_string())),
    }
}

/// Grant a new lease over an optional slot, failing when an active lease exists
pub(crate) fn grant_lease(
    slot: &mut Option<LeaseSlot>,
    duration: LeaseDuration,
    resource: &str,
    now: DateTime<Utc>,
) -> StoreResult<String> {
    if let Some(existing) = slot.as_ref() {
        if existing.is_active(now) {
            return Err(StoreError::LeaseAlreadyPresent(resource.to_string()));
        }
    }
    let granted = LeaseSlot::grant(duration, now);
    let lease_id = granted.lease_id.clone();
    *slot = Some(granted);
    Ok(lease_id)
}

/// Release a lease held in an optional slot
pub(crate) fn release_slot(
    slot: &mut Option<LeaseSlot>,
    lease_id: &str,
    resource: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    match slot.as_ref() {
        None => Err(StoreError::LeaseNotPresent(resource.to_string())),
        Some(existing) if existing.lease_id == lease_id => {
            *slot = None;
            Ok(())
        }
        Some(existing) if !existing.is_active(now) => {
            Err(StoreError::LeaseNotPresent(resource.to_string()))
        }
        Some(_) => Err(StoreError::LeaseIdMismatch(resource.to_string())),
    }
}

/// Reject object names that could escape their container
pub(crate) fn validate_object_name(object: &str) -> StoreResult<()> {
    let bad = object.is_empty()
        || object.starts_with('/')
        || object.ends_with('/')
        || object.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidName(object.to_string()));
    }
    Ok(())
}

/// Blob-store operations consumed by the index and mapping layers
///
/// Implementations must make `upload` replace a whole object atomically so
/// readers never observe a torn write.
pub trait ObjectStore: Send + Sync {
    fn container_exists(&self, container: &str) -> StoreResult<bool>;

    /// Create a container; `AlreadyExists` if it is present
    fn create_container(&self, container: &str) -> StoreResult<()>;

    fn exists(&self, container: &str, object: &str) -> StoreResult<bool>;

    fn read(&self, container: &str, object: &str) -> StoreResult<Vec<u8>>;

    fn upload(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        overwrite: bool,
        lease_id: Option<&str>,
    ) -> StoreResult<()>;

    fn delete(&self, container: &str, object: &str, lease_id: Option<&str>) -> StoreResult<()>;

    /// Object names in a container starting with `prefix`, sorted
    fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<String>>;

    fn get_metadata(&self, container: &str, object: &str) -> StoreResult<HashMap<String, String>>;

    fn set_metadata(
        &self,
        container: &str,
        object: &str,
        metadata: HashMap<String, String>,
        lease_id: Option<&str>,
    ) -> StoreResult<()>;

    /// Acquire a lease; `LeaseAlreadyPresent` while another active lease exists
    fn acquire_lease(&self, resource: &ResourceKey, duration: LeaseDuration) -> StoreResult<String>;

    fn release_lease(&self, resource: &ResourceKey, lease_id: &str) -> StoreResult<()>;

    fn lease_state(&self, resource: &ResourceKey) -> StoreResult<LeaseState>;
}
