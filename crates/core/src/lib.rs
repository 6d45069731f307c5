//! ApplicationSet core types: the set a user declares and the Applications it expands into.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod generators;

pub use generators::{
    ClusterGenerator, Generator, GeneratorKind, GitDirectory, GitFile, GitGenerator, ListGenerator,
};

pub const GROUP: &str = "argoproj.io";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "argoproj.io/v1alpha1";
pub const APPLICATION_KIND: &str = "Application";
pub const APPLICATION_SET_KIND: &str = "ApplicationSet";

/// Annotation kubectl leaves behind with the last applied manifest (raw JSON).
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// One flat parameter mapping; one mapping renders one Application.
pub type Params = BTreeMap<String, String>;

/// Identity of an Application in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// How a reconcile pass is allowed to touch the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    /// Only create missing Applications; never update or delete.
    CreateOnly,
    /// Create and update, but leave orphans in place.
    CreateUpdate,
    /// Create, update and delete Applications no longer generated.
    #[default]
    Sync,
}

impl SyncPolicy {
    pub fn updates(self) -> bool { !matches!(self, SyncPolicy::CreateOnly) }
    pub fn deletes(self) -> bool { matches!(self, SyncPolicy::Sync) }
}

/// Generated (desired) or persisted (live) Application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Opaque payload; the engine only compares and copies it.
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub spec: Json,
    /// Top-level fields the engine does not manage (`status`, `operation`); carried
    /// through read-then-write unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

impl Application {
    /// Bare Application carrying type identity, a name and a namespace.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: APPLICATION_KIND.to_string(),
            metadata: ObjectMeta {
                name: non_empty(name),
                namespace: non_empty(namespace),
                ..Default::default()
            },
            spec: Json::Null,
            extra: Default::default(),
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }
    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace(), self.name()) }

    /// Stamp apiVersion/kind when a renderer or caller left them out.
    pub fn ensure_type_meta(&mut self) {
        if self.api_version.is_empty() {
            self.api_version = API_VERSION.to_string();
        }
        if self.kind.is_empty() {
            self.kind = APPLICATION_KIND.to_string();
        }
    }

    /// The owner reference flagged `controller: true`, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .as_deref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
    }

    pub fn is_controlled_by(&self, owner: &OwnerReference) -> bool {
        self.controller_ref().map(|r| same_owner(r, owner)).unwrap_or(false)
    }

    /// Install `owner` as the controller reference.
    ///
    /// Returns the foreign controller when another object already controls this one;
    /// the metadata is left unchanged in that case.
    pub fn set_controller_reference(&mut self, owner: OwnerReference) -> Result<(), OwnerReference> {
        if let Some(current) = self.controller_ref() {
            if !same_owner(current, &owner) {
                return Err(current.clone());
            }
        }
        let refs = self.metadata.owner_references.get_or_insert_with(Vec::new);
        match refs.iter_mut().find(|r| same_owner(r, &owner)) {
            Some(existing) => *existing = owner,
            None => refs.push(owner),
        }
        Ok(())
    }
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.uid == b.uid && a.kind == b.kind && a.name == b.name
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Identity and labels of every Application rendered from a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Shape of a generated Application before parameters are substituted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub spec: Json,
}

impl Template {
    pub fn is_empty(&self) -> bool {
        self.metadata.name.is_empty()
            && self.metadata.namespace.is_empty()
            && self.metadata.labels.is_empty()
            && spec_is_empty(&self.spec)
    }

    /// Unrendered Application the renderer works on.
    pub fn to_application(&self) -> Application {
        let mut app = Application::new(&self.metadata.namespace, &self.metadata.name);
        if !self.metadata.labels.is_empty() {
            app.metadata.labels = Some(self.metadata.labels.clone());
        }
        app.spec = self.spec.clone();
        app
    }
}

/// Null, `{}` and `[]` all count as "no spec".
pub fn spec_is_empty(spec: &Json) -> bool {
    match spec {
        Json::Null => true,
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    #[serde(default)]
    pub generators: Vec<Generator>,
    #[serde(default)]
    pub template: Template,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

/// The user's declaration: generators plus one template. Never mutated by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSet {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApplicationSetSpec,
}

impl ApplicationSet {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }

    /// Back-reference stamped on every Application this set creates.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: APPLICATION_SET_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn last_applied_configuration(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
            .map(String::as_str)
    }
}
