//! Application store: the contract the synchronizer writes through, plus an in-RAM store.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use appset_core::{Application, ObjectKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Store failures, shaped after the API server's status reasons.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(ObjectKey),
    #[error("already_exists: {0}")]
    AlreadyExists(ObjectKey),
    /// Write carried a stale resourceVersion.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity-keyed access to Applications.
///
/// Every write returns the object as stored, carrying the resourceVersion the store
/// assigned. Callers never invent a resourceVersion: `update` must carry the one read back
/// from `get`.
#[async_trait::async_trait]
pub trait AppStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Application>>;

    async fn create(&self, app: &Application) -> StoreResult<Application>;

    /// Replace an existing object; fails with `Conflict` if its resourceVersion moved on.
    async fn update(&self, app: &Application) -> StoreResult<Application>;

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Applications in `namespace` whose controller reference is `owner`.
    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> StoreResult<Vec<Application>>;
}

/// Reject payloads the store could not dispatch on.
pub fn check_writable(app: &Application) -> StoreResult<()> {
    if app.api_version.is_empty() || app.kind.is_empty() {
        return Err(StoreError::Invalid(format!("{}: apiVersion and kind are required", app.key())));
    }
    if app.name().is_empty() {
        return Err(StoreError::Invalid("metadata.name is required".to_string()));
    }
    Ok(())
}

/// In-process store with API-server-like semantics: resourceVersions start at "1" and
/// advance on every update; uids are assigned on create.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<FxHashMap<ObjectKey, Application>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Seed with pre-existing objects. Objects without a resourceVersion get "1".
    pub fn with_objects(objects: impl IntoIterator<Item = Application>) -> Self {
        let mut map = FxHashMap::default();
        for mut obj in objects {
            if obj.metadata.resource_version.is_none() {
                obj.metadata.resource_version = Some("1".to_string());
            }
            map.insert(obj.key(), obj);
        }
        Self { objects: RwLock::new(map), writes: AtomicU64::new(0) }
    }

    /// Number of successful create/update/delete calls so far.
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::Relaxed) }

    /// All stored objects ordered by (namespace, name).
    pub async fn snapshot(&self) -> Vec<Application> {
        let map = self.objects.read().await;
        let mut items: Vec<Application> = map.values().cloned().collect();
        items.sort_by_key(Application::key);
        items
    }

    fn bump(&self) { self.writes.fetch_add(1, Ordering::Relaxed); }
}

fn next_version(current: &str) -> String {
    current.parse::<u64>().map(|n| n.saturating_add(1)).unwrap_or(1).to_string()
}

#[async_trait::async_trait]
impl AppStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Application>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn create(&self, app: &Application) -> StoreResult<Application> {
        check_writable(app)?;
        let key = app.key();
        let mut map = self.objects.write().await;
        if map.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let mut stored = app.clone();
        stored.metadata.resource_version = Some("1".to_string());
        if stored.metadata.uid.is_none() {
            stored.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        map.insert(key.clone(), stored.clone());
        self.bump();
        debug!(key = %key, "memory store: created");
        Ok(stored)
    }

    async fn update(&self, app: &Application) -> StoreResult<Application> {
        check_writable(app)?;
        let key = app.key();
        let mut map = self.objects.write().await;
        let current = map.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let current_rv = current.resource_version().unwrap_or("");
        match app.resource_version() {
            None => return Err(StoreError::Invalid(format!("{}: update requires resourceVersion", key))),
            Some(rv) if rv != current_rv => {
                return Err(StoreError::Conflict(format!(
                    "{}: resourceVersion {} is stale (current {})",
                    key, rv, current_rv
                )));
            }
            Some(_) => {}
        }
        let mut stored = app.clone();
        stored.metadata.resource_version = Some(next_version(current_rv));
        stored.metadata.uid = current.metadata.uid.clone();
        map.insert(key.clone(), stored.clone());
        self.bump();
        debug!(key = %key, rv = ?stored.metadata.resource_version, "memory store: updated");
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut map = self.objects.write().await;
        match map.remove(key) {
            Some(_) => {
                self.bump();
                debug!(key = %key, "memory store: deleted");
                Ok(())
            }
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> StoreResult<Vec<Application>> {
        let map = self.objects.read().await;
        let mut items: Vec<Application> = map
            .values()
            .filter(|a| a.namespace() == namespace && a.is_controlled_by(owner))
            .cloned()
            .collect();
        items.sort_by_key(Application::key);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_core::{APPLICATION_SET_KIND, API_VERSION};

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.into(),
            kind: APPLICATION_SET_KIND.into(),
            name: "name".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[tokio::test]
    async fn create_assigns_initial_version_and_uid() {
        let store = MemoryStore::new();
        let created = store.create(&Application::new("namespace", "app1")).await.unwrap();
        assert_eq!(created.resource_version(), Some("1"));
        assert!(created.metadata.uid.is_some());
        assert_eq!(store.writes(), 1);

        let err = store.create(&Application::new("namespace", "app1")).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(ObjectKey::new("namespace", "app1")));
    }

    #[tokio::test]
    async fn update_requires_current_version() {
        let mut seeded = Application::new("namespace", "app1");
        seeded.metadata.resource_version = Some("2".into());
        let store = MemoryStore::with_objects([seeded]);

        let mut live = store.get(&ObjectKey::new("namespace", "app1")).await.unwrap().unwrap();
        live.spec = serde_json::json!({"project": "project"});
        let updated = store.update(&live).await.unwrap();
        assert_eq!(updated.resource_version(), Some("3"));

        // Writing again with the token we already consumed is a conflict.
        let err = store.update(&live).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "err={:?}", err);

        let mut tokenless = live.clone();
        tokenless.metadata.resource_version = None;
        assert!(matches!(store.update(&tokenless).await.unwrap_err(), StoreError::Invalid(_)));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn rejects_payload_without_type_meta() {
        let store = MemoryStore::new();
        let mut app = Application::new("ns", "a");
        app.kind.clear();
        assert!(matches!(store.create(&app).await.unwrap_err(), StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn list_owned_filters_by_controller_and_namespace() {
        let mut mine = Application::new("ns", "mine");
        mine.set_controller_reference(owner("uid-1")).unwrap();
        let mut theirs = Application::new("ns", "theirs");
        theirs.set_controller_reference(owner("uid-2")).unwrap();
        let mut elsewhere = Application::new("other", "mine-elsewhere");
        elsewhere.set_controller_reference(owner("uid-1")).unwrap();
        let orphan = Application::new("ns", "orphan");
        let store = MemoryStore::with_objects([mine, theirs, elsewhere, orphan]);

        let owned = store.list_owned("ns", &owner("uid-1")).await.unwrap();
        let names: Vec<&str> = owned.iter().map(Application::name).collect();
        assert_eq!(names, vec!["mine"]);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::with_objects([Application::new("ns", "a")]);
        store.delete(&ObjectKey::new("ns", "a")).await.unwrap();
        assert!(store.snapshot().await.is_empty());
        assert!(matches!(store.delete(&ObjectKey::new("ns", "a")).await.unwrap_err(), StoreError::NotFound(_)));
    }

    #[test]
    fn version_arithmetic() {
        assert_eq!(next_version("1"), "2");
        assert_eq!(next_version("41"), "42");
        assert_eq!(next_version("opaque"), "1");
    }
}
