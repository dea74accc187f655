//! Lease lock: a distributed mutex over object-store leases
//!
//! Mutual exclusion comes from the store's native leases. The registry kept
//! here only remembers which lease ids this instance holds so they can be
//! presented on writes and released on teardown.

use crate::error::{BlobdexError, Result};
use crate::storage::{LeaseDuration, ObjectStore, ResourceKey, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of attempts before giving up on a contended resource
pub const DEFAULT_MAX_RETRIES: u32 = 12;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Retry policy for lease acquisition and resource creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// An acquired lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: ResourceKey,
    pub lease_id: String,
}

/// Acquires and tracks leases for one actor
pub struct LeaseLock {
    store: Arc<dyn ObjectStore>,
    options: LeaseOptions,
    leases: Mutex<HashMap<ResourceKey, String>>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_options(store, LeaseOptions::default())
    }

    pub fn with_options(store: Arc<dyn ObjectStore>, options: LeaseOptions) -> Self {
        Self {
            store,
            options,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn options(&self) -> LeaseOptions {
        self.options
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<ResourceKey, String>>> {
        self.leases.lock().map_err(|_| {
            BlobdexError::Store(StoreError::Backend(
                "lease registry mutex poisoned".to_string(),
            ))
        })
    }

    /// Make sure the container (and object, if any) exists
    ///
    /// Creation is retried while a previous incarnation of the container is
    /// still being deleted. With `create_if_not_exists` unset a missing
    /// resource is reported as `NotFound`.
    pub fn ensure_resource(&self, resource: &ResourceKey, create_if_not_exists: bool) -> Result<()> {
        let container = resource.container.as_str();
        let max_retries = self.options.max_retries.max(1);

        let mut ready = false;
        for attempt in 1..=max_retries {
            if self.store.container_exists(container)? {
                ready = true;
                break;
            }
            if !create_if_not_exists {
                return Err(StoreError::ContainerNotFound(container.to_string()).into());
            }
            match self.store.create_container(container) {
                Ok(()) => {
                    info!("Container '{}' created", container);
                    ready = true;
                    break;
                }
                Err(StoreError::AlreadyExists(_)) => {
                    ready = true;
                    break;
                }
                Err(StoreError::ContainerBeingDeleted(_)) if attempt < max_retries => {
                    warn!(
                        "Container '{}' is being deleted. Attempt {}/{}, retrying in {:?}",
                        container, attempt, max_retries, self.options.retry_delay
                    );
                    std::thread::sleep(self.options.retry_delay);
                }
                Err(e) => {
                    error!("Failed to create container '{}': {}", container, e);
                    return Err(e.into());
                }
            }
        }
        if !ready {
            return Err(BlobdexError::LockAcquisition {
                resource: resource.to_string(),
                attempts: max_retries,
            });
        }

        if let Some(object) = &resource.object {
            if !self.store.exists(container, object)? {
                if !create_if_not_exists {
                    return Err(StoreError::not_found(container, object).into());
                }
                match self.store.upload(container, object, b"", false, None) {
                    Ok(()) => info!("Created empty object '{}'", resource),
                    // someone else created it between our check and upload
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Acquire a lease, creating the resource first when it is missing
    ///
    /// A resource that already carries an active lease is retried up to the
    /// configured budget before failing with `LockAcquisition`.
    pub fn acquire(&self, resource: &ResourceKey, duration: LeaseDuration) -> Result<Lease> {
        self.ensure_resource(resource, true)?;

        let max_retries = self.options.max_retries.max(1);
        for attempt in 1..=max_retries {
            match self.store.acquire_lease(resource, duration) {
                Ok(lease_id) => {
                    info!("Acquired lease {} on {}", lease_id, resource);
                    self.registry()?.insert(resource.clone(), lease_id.clone());
                    return Ok(Lease {
                        resource: resource.clone(),
                        lease_id,
                    });
                }
                Err(StoreError::LeaseAlreadyPresent(_)) => {
                    if attempt < max_retries {
                        debug!(
                            "{} is leased. Attempt {}/{}, retrying in {:?}",
                            resource, attempt, max_retries, self.options.retry_delay
                        );
                        std::thread::sleep(self.options.retry_delay);
                    }
                }
                Err(e) => {
                    error!("Failed to acquire lease on {}: {}", resource, e);
                    return Err(e.into());
                }
            }
        }

        error!(
            "Failed to acquire lease on {} after {} attempts",
            resource, max_retries
        );
        Err(BlobdexError::LockAcquisition {
            resource: resource.to_string(),
            attempts: max_retries,
        })
    }

    /// Acquire with a duration in seconds (15..=60, or -1 for indefinite)
    pub fn acquire_secs(&self, resource: &ResourceKey, secs: i64) -> Result<Lease> {
        let duration = LeaseDuration::from_secs(secs)?;
        self.acquire(resource, duration)
    }

    /// Lease id this instance holds on the resource, if any
    pub fn lease_id(&self, resource: &ResourceKey) -> Option<String> {
        self.registry()
            .ok()
            .and_then(|leases| leases.get(resource).cloned())
    }

    /// Overwrite an object, presenting the lease this instance holds on it
    pub fn upload(&self, container: &str, object: &str, data: &[u8]) -> Result<()> {
        let lease_id = self.lease_id(&ResourceKey::object(container, object));
        self.store
            .upload(container, object, data, true, lease_id.as_deref())?;
        Ok(())
    }

    /// Delete an object, presenting the lease this instance holds on it
    pub fn delete(&self, container: &str, object: &str) -> Result<()> {
        let lease_id = self.lease_id(&ResourceKey::object(container, object));
        self.store.delete(container, object, lease_id.as_deref())?;
        Ok(())
    }

    /// Replace an object's metadata, presenting the lease this instance holds on it
    pub fn set_metadata(
        &self,
        container: &str,
        object: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let lease_id = self.lease_id(&ResourceKey::object(container, object));
        self.store
            .set_metadata(container, object, metadata, lease_id.as_deref())?;
        Ok(())
    }

    /// Resources currently leased by this instance
    pub fn held(&self) -> Vec<ResourceKey> {
        let mut held: Vec<ResourceKey> = self
            .registry()
            .map(|leases| leases.keys().cloned().collect())
            .unwrap_or_default();
        held.sort();
        held
    }

    /// Release the lease held on the resource
    ///
    /// Never fails: unknown resources, vanished objects and leases already
    /// taken over by someone else are logged and ignored.
    pub fn release(&self, resource: &ResourceKey) {
        let lease_id = match self.registry() {
            Ok(mut leases) => leases.remove(resource),
            Err(e) => {
                error!("Cannot release lease on {}: {}", resource, e);
                return;
            }
        };
        let Some(lease_id) = lease_id else {
            debug!("No lease held on {}", resource);
            return;
        };

        match self.store.release_lease(resource, &lease_id) {
            Ok(()) => info!("Released lease {} on {}", lease_id, resource),
            Err(e) if e.is_not_found() => {
                debug!("Resource for lease {} on {} no longer exists", lease_id, resource)
            }
            Err(StoreError::LeaseIdMismatch(_)) | Err(StoreError::LeaseNotPresent(_)) => debug!(
                "Lease {} on {} was already released or taken over",
                lease_id, resource
            ),
            Err(e) => error!("Failed to release lease {} on {}: {}", lease_id, resource, e),
        }
    }

    /// Release every lease this instance holds
    pub fn release_all(&self) {
        for resource in self.held() {
            self.release(&resource);
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        self.release_all();
    }
}
