//! In-memory credential and authorization caches.
//!
//! The only process-global mutable state in the server. Four logically
//! separate mappings live behind a single reader-writer lock so a refresh
//! is observed atomically:
//!
//! - access key id → secret access key (SigV4 hot path)
//! - access key id → owner user id
//! - owner user id → set of owned bucket names
//! - bucket name → versioning state (read on every write)
//!
//! Lookups take the shared lock, mutations the exclusive lock. The caches
//! are strictly derived from the catalog: every catalog mutation is
//! mirrored here, and a cold start repopulates from
//! `Catalog::active_access_keys` plus the bucket table.

use crate::catalog::{Catalog, CatalogError};
use crate::types::VersioningState;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Outcome of an authorization check against a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// The bucket does not exist at all.
    NoSuchBucket,
    /// The bucket exists but the key's owner does not own it.
    Unauthorized,
}

#[derive(Default)]
struct Inner {
    secrets: HashMap<String, String>,
    owners: HashMap<String, String>,
    owner_buckets: HashMap<String, HashSet<String>>,
    bucket_owners: HashMap<String, String>,
    versioning: HashMap<String, VersioningState>,
}

/// Thread-safe credential/authorization cache.
#[derive(Default)]
pub struct CredentialCache {
    inner: RwLock<Inner>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from the persistent catalog: non-expired access keys and
    /// every bucket row.
    pub fn from_catalog(catalog: &Catalog) -> Result<Self, CatalogError> {
        let cache = Self::new();
        {
            let mut inner = cache.inner.write();
            for key in catalog.active_access_keys()? {
                inner
                    .secrets
                    .insert(key.access_key_id.clone(), key.secret_access_key.clone());
                inner.owners.insert(key.access_key_id, key.owner_user_id);
            }
            for bucket in catalog.all_buckets()? {
                inner
                    .owner_buckets
                    .entry(bucket.owner_user_id.clone())
                    .or_default()
                    .insert(bucket.name.clone());
                inner
                    .bucket_owners
                    .insert(bucket.name.clone(), bucket.owner_user_id);
                inner.versioning.insert(bucket.name, bucket.versioning);
            }
        }
        Ok(cache)
    }

    // === Mutations (exclusive lock) ===

    pub fn add_key(&self, access_key_id: &str, secret: &str, owner_user_id: &str) {
        let mut inner = self.inner.write();
        inner
            .secrets
            .insert(access_key_id.to_string(), secret.to_string());
        inner
            .owners
            .insert(access_key_id.to_string(), owner_user_id.to_string());
    }

    pub fn remove_key(&self, access_key_id: &str) {
        let mut inner = self.inner.write();
        inner.secrets.remove(access_key_id);
        inner.owners.remove(access_key_id);
    }

    pub fn add_bucket_for_owner(&self, owner_user_id: &str, bucket: &str) {
        let mut inner = self.inner.write();
        inner
            .owner_buckets
            .entry(owner_user_id.to_string())
            .or_default()
            .insert(bucket.to_string());
        inner
            .bucket_owners
            .insert(bucket.to_string(), owner_user_id.to_string());
        inner
            .versioning
            .insert(bucket.to_string(), VersioningState::Disabled);
    }

    pub fn remove_bucket(&self, bucket: &str) {
        let mut inner = self.inner.write();
        if let Some(owner) = inner.bucket_owners.remove(bucket) {
            if let Some(set) = inner.owner_buckets.get_mut(&owner) {
                set.remove(bucket);
            }
        }
        inner.versioning.remove(bucket);
    }

    pub fn set_versioning(&self, bucket: &str, state: VersioningState) {
        self.inner
            .write()
            .versioning
            .insert(bucket.to_string(), state);
    }

    // === Lookups (shared lock) ===

    pub fn get_secret(&self, access_key_id: &str) -> Option<String> {
        self.inner.read().secrets.get(access_key_id).cloned()
    }

    pub fn owner_of(&self, access_key_id: &str) -> Option<String> {
        self.inner.read().owners.get(access_key_id).cloned()
    }

    pub fn versioning_of(&self, bucket: &str) -> Option<VersioningState> {
        self.inner.read().versioning.get(bucket).copied()
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.inner.read().versioning.contains_key(bucket)
    }

    /// Authorize `access_key_id` against `bucket`, returning the owner
    /// user id on success.
    pub fn authorize(&self, access_key_id: &str, bucket: &str) -> Result<String, AuthzError> {
        let inner = self.inner.read();
        let owner = inner
            .owners
            .get(access_key_id)
            .ok_or(AuthzError::Unauthorized)?;
        if !inner.versioning.contains_key(bucket) {
            return Err(AuthzError::NoSuchBucket);
        }
        let owns = inner
            .owner_buckets
            .get(owner)
            .map(|set| set.contains(bucket))
            .unwrap_or(false);
        if owns {
            Ok(owner.clone())
        } else {
            Err(AuthzError::Unauthorized)
        }
    }
}
