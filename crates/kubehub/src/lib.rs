//! Kubernetes wiring: Application store over the API server and ApplicationSet loading.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use appset_core::{Application, ApplicationSet, ObjectKey, APPLICATION_KIND, APPLICATION_SET_KIND, GROUP, VERSION};
use appset_store::{check_writable, AppStore, StoreError, StoreResult};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use tracing::{debug, info};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from current context")
}

pub fn application_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, APPLICATION_KIND))
}

pub fn application_set_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, APPLICATION_SET_KIND))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Read the live ApplicationSet. Each call hits the API server; nothing is cached.
pub async fn fetch_application_set(client: Client, namespace: &str, name: &str) -> Result<ApplicationSet> {
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &application_set_resource());
    let obj = api
        .get(name)
        .await
        .with_context(|| format!("fetching ApplicationSet {}/{}", namespace, name))?;
    let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).with_context(|| format!("decoding ApplicationSet {}/{}", namespace, name))
}

fn to_dynamic(app: &Application) -> StoreResult<DynamicObject> {
    let raw = serde_json::to_value(app).map_err(|e| StoreError::Invalid(format!("{}: {}", app.key(), e)))?;
    serde_json::from_value(raw).map_err(|e| StoreError::Invalid(format!("{}: {}", app.key(), e)))
}

fn from_dynamic(obj: &DynamicObject) -> StoreResult<Application> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).map_err(|e| StoreError::Invalid(e.to_string()))
}

/// Translate API server failures into store errors; 409 on create means the name is taken,
/// 409 on update means our resourceVersion went stale.
fn map_kube_err(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(key.clone()),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(key.clone()),
            409 => StoreError::Conflict(format!("{}: {}", key, resp.message)),
            400 | 422 => StoreError::Invalid(format!("{}: {}", key, resp.message)),
            _ => StoreError::Unavailable(format!("{}: {} ({})", key, resp.message, resp.code)),
        },
        other => StoreError::Unavailable(format!("{}: {}", key, other)),
    }
}

/// Store backed by `argoproj.io/v1alpha1` Applications on the current cluster.
pub struct KubeStore {
    client: Client,
    ar: ApiResource,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, ar: application_resource() } }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }
}

#[async_trait::async_trait]
impl AppStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Application>> {
        let found = self.api(&key.namespace).get_opt(&key.name).await.map_err(|e| map_kube_err(key, e))?;
        found.as_ref().map(from_dynamic).transpose()
    }

    async fn create(&self, app: &Application) -> StoreResult<Application> {
        check_writable(app)?;
        let key = app.key();
        let obj = to_dynamic(app)?;
        let created = self
            .api(&key.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(&key, e))?;
        counter!("kube_store_writes", 1u64);
        info!(key = %key, rv = ?created.metadata.resource_version, "kube store: created");
        from_dynamic(&created)
    }

    async fn update(&self, app: &Application) -> StoreResult<Application> {
        check_writable(app)?;
        let key = app.key();
        if app.resource_version().is_none() {
            return Err(StoreError::Invalid(format!("{}: update requires resourceVersion", key)));
        }
        let obj = to_dynamic(app)?;
        let updated = self
            .api(&key.namespace)
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(&key, e))?;
        counter!("kube_store_writes", 1u64);
        info!(key = %key, rv = ?updated.metadata.resource_version, "kube store: replaced");
        from_dynamic(&updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(key, e))?;
        counter!("kube_store_writes", 1u64);
        info!(key = %key, "kube store: deleted");
        Ok(())
    }

    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> StoreResult<Vec<Application>> {
        let scope = ObjectKey::new(namespace, "");
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(|e| map_kube_err(&scope, e))?;
        let total = list.items.len();
        let mut owned = Vec::new();
        for obj in &list.items {
            let app = from_dynamic(obj)?;
            if app.is_controlled_by(owner) {
                owned.push(app);
            }
        }
        debug!(ns = %namespace, owner = %owner.name, total, owned = owned.len(), "kube store: listed");
        Ok(owned)
    }
}
