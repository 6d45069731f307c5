//! Cluster synchronizer: create, create-or-update and orphan deletion against an [`AppStore`].

use std::collections::HashSet;

use appset_core::{Application, ApplicationSet};
use appset_store::{AppStore, StoreError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl SyncStats {
    pub fn writes(&self) -> usize { self.created + self.updated + self.deleted }

    fn absorb(&mut self, other: SyncStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }
}

impl std::ops::Add for SyncStats {
    type Output = SyncStats;
    fn add(mut self, rhs: SyncStats) -> SyncStats {
        self.absorb(rhs);
        self
    }
}

/// Desired Application as it should be stored: in the set's namespace (any template
/// namespace is overridden), type meta present, controlled by the set.
fn owned_copy(set: &ApplicationSet, owner: &OwnerReference, app: &Application) -> Result<Application, EngineError> {
    let mut want = app.clone();
    if want.namespace() != set.namespace() {
        if !want.namespace().is_empty() {
            debug!(set = %set.name(), app = %want.name(), from = %want.namespace(), "placing application in set namespace");
        }
        want.metadata.namespace = Some(set.namespace().to_string());
    }
    want.ensure_type_meta();
    want.metadata.resource_version = None;
    want.metadata.labels = want.metadata.labels.take().filter(|l| !l.is_empty());
    want.set_controller_reference(owner.clone()).map_err(|foreign| foreign_owner(&want, foreign))?;
    Ok(want)
}

fn foreign_owner(app: &Application, foreign: OwnerReference) -> EngineError {
    EngineError::ForeignOwner { key: app.key(), owner_kind: foreign.kind, owner_name: foreign.name }
}

/// Apply `mutate` to `live` and write the result with the resourceVersion `live` was
/// read with. Returns `None` without writing when the mutation changed nothing.
///
/// A concurrent writer surfaces as [`EngineError::StoreWriteConflict`]; retrying is the
/// caller's business.
pub async fn update_with_token<F>(
    store: &dyn AppStore,
    live: Application,
    mutate: F,
) -> Result<Option<Application>, EngineError>
where
    F: FnOnce(&mut Application) -> Result<(), EngineError>,
{
    let mut next = live.clone();
    mutate(&mut next)?;
    if next == live {
        return Ok(None);
    }
    next.metadata.resource_version = live.metadata.resource_version.clone();
    Ok(Some(store.update(&next).await?))
}

/// Copy the managed fields (spec, labels, controller reference) from `want` onto `live`.
fn adopt_managed_fields(live: &mut Application, want: &Application, owner: &OwnerReference) -> Result<(), EngineError> {
    live.set_controller_reference(owner.clone()).map_err(|foreign| foreign_owner(live, foreign))?;
    live.spec = want.spec.clone();
    live.metadata.labels = want.metadata.labels.clone();
    Ok(())
}

/// Create missing Applications and bring existing ones in line with `desired`.
/// Applications not in `desired` are left alone.
pub async fn create_or_update_in_cluster(
    store: &dyn AppStore,
    set: &ApplicationSet,
    desired: &[Application],
) -> Result<SyncStats, EngineError> {
    let owner = set.owner_reference();
    let mut stats = SyncStats::default();
    for app in desired {
        let want = owned_copy(set, &owner, app)?;
        let key = want.key();
        match store.get(&key).await? {
            None => {
                let created = store.create(&want).await?;
                counter!("appset_apps_created", 1u64);
                info!(set = %set.name(), key = %key, rv = ?created.metadata.resource_version, "created application");
                stats.created += 1;
            }
            Some(live) => match update_with_token(store, live, |obj| adopt_managed_fields(obj, &want, &owner)).await? {
                Some(updated) => {
                    counter!("appset_apps_updated", 1u64);
                    info!(set = %set.name(), key = %key, rv = ?updated.metadata.resource_version, "updated application");
                    stats.updated += 1;
                }
                None => {
                    debug!(set = %set.name(), key = %key, "application unchanged");
                    stats.unchanged += 1;
                }
            },
        }
    }
    Ok(stats)
}

/// Create missing Applications only; existing ones are never written, whatever their spec.
pub async fn create_in_cluster(
    store: &dyn AppStore,
    set: &ApplicationSet,
    desired: &[Application],
) -> Result<SyncStats, EngineError> {
    let owner = set.owner_reference();
    let mut stats = SyncStats::default();
    for app in desired {
        let want = owned_copy(set, &owner, app)?;
        let key = want.key();
        if store.get(&key).await?.is_some() {
            debug!(set = %set.name(), key = %key, "application exists; create-only leaves it");
            stats.unchanged += 1;
            continue;
        }
        let created = store.create(&want).await?;
        counter!("appset_apps_created", 1u64);
        info!(set = %set.name(), key = %key, rv = ?created.metadata.resource_version, "created application");
        stats.created += 1;
    }
    Ok(stats)
}

/// Delete Applications controlled by `set` whose name is not in `desired`.
pub async fn delete_in_cluster(
    store: &dyn AppStore,
    set: &ApplicationSet,
    desired: &[Application],
) -> Result<SyncStats, EngineError> {
    let owner = set.owner_reference();
    let keep: HashSet<&str> = desired.iter().map(Application::name).collect();
    let mut stats = SyncStats::default();
    for live in store.list_owned(set.namespace(), &owner).await? {
        if keep.contains(live.name()) {
            continue;
        }
        let key = live.key();
        match store.delete(&key).await {
            Ok(()) => {
                counter!("appset_apps_deleted", 1u64);
                info!(set = %set.name(), key = %key, "deleted application");
                stats.deleted += 1;
            }
            // Already gone is the state we wanted.
            Err(StoreError::NotFound(_)) => debug!(set = %set.name(), key = %key, "application already deleted"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_core::ObjectKey;
    use appset_store::{MemoryStore, StoreResult};
    use serde_json::json;

    fn app_set() -> ApplicationSet {
        let mut set = ApplicationSet::default();
        set.metadata.name = Some("name".into());
        set.metadata.namespace = Some("namespace".into());
        set.metadata.uid = Some("set-uid".into());
        set
    }

    fn desired(name: &str, project: Option<&str>) -> Application {
        let mut app = Application::new("", name);
        if let Some(p) = project {
            app.spec = json!({ "project": p });
        }
        app
    }

    fn existing(name: &str, rv: &str, project: &str, set: &ApplicationSet) -> Application {
        let mut app = Application::new("namespace", name);
        app.metadata.resource_version = Some(rv.into());
        app.spec = json!({ "project": project });
        app.set_controller_reference(set.owner_reference()).unwrap();
        app
    }

    async fn live(store: &MemoryStore, name: &str) -> Option<Application> {
        store.get(&ObjectKey::new("namespace", name)).await.unwrap()
    }

    #[tokio::test]
    async fn creates_missing_in_set_namespace_with_owner() {
        let set = app_set();
        let store = MemoryStore::new();
        let stats = create_or_update_in_cluster(&store, &set, &[desired("app1", None)]).await.unwrap();
        assert_eq!(stats, SyncStats { created: 1, ..Default::default() });

        let got = live(&store, "app1").await.unwrap();
        assert_eq!(got.api_version, "argoproj.io/v1alpha1");
        assert_eq!(got.kind, "Application");
        assert_eq!(got.resource_version(), Some("1"));
        assert!(got.is_controlled_by(&set.owner_reference()));
    }

    #[tokio::test]
    async fn updates_changed_spec_with_live_token() {
        let set = app_set();
        let store = MemoryStore::with_objects([existing("app1", "2", "test", &set)]);
        let stats = create_or_update_in_cluster(&store, &set, &[desired("app1", Some("project"))]).await.unwrap();
        assert_eq!(stats.updated, 1);

        let got = live(&store, "app1").await.unwrap();
        assert_eq!(got.resource_version(), Some("3"));
        assert_eq!(got.spec["project"], "project");
    }

    #[tokio::test]
    async fn second_identical_pass_writes_nothing() {
        let set = app_set();
        let store = MemoryStore::new();
        let want = [desired("app1", Some("p")), desired("app2", Some("p"))];
        create_or_update_in_cluster(&store, &set, &want).await.unwrap();
        assert_eq!(store.writes(), 2);

        let again = create_or_update_in_cluster(&store, &set, &want).await.unwrap();
        assert_eq!(again, SyncStats { unchanged: 2, ..Default::default() });
        assert_eq!(store.writes(), 2);
        assert_eq!(live(&store, "app1").await.unwrap().resource_version(), Some("1"));
    }

    #[tokio::test]
    async fn labels_only_change_replaces_live_labels() {
        let set = app_set();
        let mut seeded = existing("app1", "2", "project", &set);
        seeded.metadata.labels = Some([("a".to_string(), "1".to_string()), ("external".to_string(), "x".to_string())].into());
        let store = MemoryStore::with_objects([seeded]);

        let mut want = desired("app1", Some("project"));
        want.metadata.labels = Some([("a".to_string(), "2".to_string())].into());
        let stats = create_or_update_in_cluster(&store, &set, &[want.clone()]).await.unwrap();
        assert_eq!(stats, SyncStats { updated: 1, ..Default::default() });

        let got = live(&store, "app1").await.unwrap();
        assert_eq!(got.resource_version(), Some("3"));
        assert_eq!(got.metadata.labels, Some([("a".to_string(), "2".to_string())].into()));
        assert_eq!(got.spec["project"], "project");

        let again = create_or_update_in_cluster(&store, &set, &[want]).await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(live(&store, "app1").await.unwrap().resource_version(), Some("3"));
    }

    #[tokio::test]
    async fn template_namespace_is_replaced_by_set_namespace() {
        let set = app_set();
        let store = MemoryStore::new();
        let stats = create_or_update_in_cluster(&store, &set, &[Application::new("team-a", "app1")]).await.unwrap();
        assert_eq!(stats.created, 1);
        assert!(live(&store, "app1").await.is_some());
        assert!(store.get(&ObjectKey::new("team-a", "app1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_keeps_unmanaged_metadata() {
        let set = app_set();
        let mut seeded = existing("app1", "5", "old", &set);
        seeded.metadata.annotations = Some([("notes".to_string(), "hand edited".to_string())].into());
        seeded.metadata.finalizers = Some(vec!["resources-finalizer.argocd.argoproj.io".into()]);
        seeded.extra.insert("status".into(), json!({"sync": {"status": "Synced"}}));
        let store = MemoryStore::with_objects([seeded]);

        create_or_update_in_cluster(&store, &set, &[desired("app1", Some("new"))]).await.unwrap();
        let got = live(&store, "app1").await.unwrap();
        assert_eq!(got.spec["project"], "new");
        assert_eq!(got.metadata.annotations.unwrap()["notes"], "hand edited");
        assert_eq!(got.metadata.finalizers.unwrap().len(), 1);
        assert_eq!(got.extra["status"]["sync"]["status"], "Synced");
    }

    #[tokio::test]
    async fn leaves_undesired_apps_alone() {
        let set = app_set();
        let store = MemoryStore::with_objects([existing("app1", "2", "test", &set)]);
        create_or_update_in_cluster(&store, &set, &[desired("app2", Some("project"))]).await.unwrap();

        let kept = live(&store, "app1").await.unwrap();
        assert_eq!(kept.resource_version(), Some("2"));
        assert_eq!(kept.spec["project"], "test");
        assert_eq!(live(&store, "app2").await.unwrap().resource_version(), Some("1"));
    }

    #[tokio::test]
    async fn refuses_apps_controlled_by_another_set() {
        let set = app_set();
        let mut other = app_set();
        other.metadata.name = Some("other".into());
        other.metadata.uid = Some("other-uid".into());
        let store = MemoryStore::with_objects([existing("app1", "2", "test", &other)]);

        let err = create_or_update_in_cluster(&store, &set, &[desired("app1", Some("p"))]).await.unwrap_err();
        assert!(matches!(err, EngineError::ForeignOwner { .. }), "err={:?}", err);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn create_only_never_touches_existing() {
        let set = app_set();
        let store = MemoryStore::with_objects([existing("app1", "2", "test", &set)]);
        let stats = create_in_cluster(&store, &set, &[desired("app1", Some("project")), desired("app2", Some("project"))])
            .await
            .unwrap();
        assert_eq!(stats, SyncStats { created: 1, unchanged: 1, ..Default::default() });

        let kept = live(&store, "app1").await.unwrap();
        assert_eq!(kept.resource_version(), Some("2"));
        assert_eq!(kept.spec["project"], "test");
        let created = live(&store, "app2").await.unwrap();
        assert_eq!(created.resource_version(), Some("1"));
        assert!(created.is_controlled_by(&set.owner_reference()));
    }

    #[tokio::test]
    async fn deletes_only_owned_orphans() {
        let set = app_set();
        let unowned = Application::new("namespace", "unowned");
        let store = MemoryStore::with_objects([
            existing("delete", "2", "project", &set),
            existing("keep", "2", "project", &set),
            unowned,
        ]);
        let stats = delete_in_cluster(&store, &set, &[desired("keep", Some("project"))]).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(live(&store, "delete").await.is_none());
        assert_eq!(live(&store, "keep").await.unwrap().resource_version(), Some("2"));
        assert!(live(&store, "unowned").await.is_some());
    }

    /// Delegates to a MemoryStore but fails every update with a stale-token conflict.
    struct RacingStore(MemoryStore);

    #[async_trait::async_trait]
    impl AppStore for RacingStore {
        async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Application>> { self.0.get(key).await }
        async fn create(&self, app: &Application) -> StoreResult<Application> { self.0.create(app).await }
        async fn update(&self, app: &Application) -> StoreResult<Application> {
            Err(StoreError::Conflict(format!("{}: object has been modified", app.key())))
        }
        async fn delete(&self, key: &ObjectKey) -> StoreResult<()> { self.0.delete(key).await }
        async fn list_owned(&self, ns: &str, owner: &OwnerReference) -> StoreResult<Vec<Application>> {
            self.0.list_owned(ns, owner).await
        }
    }

    #[tokio::test]
    async fn stale_token_surfaces_as_conflict() {
        let set = app_set();
        let store = RacingStore(MemoryStore::with_objects([existing("app1", "2", "test", &set)]));
        let err = create_or_update_in_cluster(&store, &set, &[desired("app1", Some("new")), desired("app2", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StoreWriteConflict(_)));
        assert!(err.is_retryable());
        // The pass stopped at the failed write.
        assert!(store.0.get(&ObjectKey::new("namespace", "app2")).await.unwrap().is_none());
    }

    #[test]
    fn stats_add_up() {
        let a = SyncStats { created: 1, updated: 2, unchanged: 0, deleted: 0 };
        let b = SyncStats { created: 0, updated: 0, unchanged: 3, deleted: 1 };
        let sum = a + b;
        assert_eq!(sum, SyncStats { created: 1, updated: 2, unchanged: 3, deleted: 1 });
        assert_eq!(sum.writes(), 4);
    }
}
