//! Generator configuration as declared on an ApplicationSet.
//!
//! On the wire every entry is an object with exactly one kind key (`{"list": {...}}`).
//! In memory it is a closed sum type; an entry carrying no known key is kept as
//! [`Generator::Unrecognized`] so validation can report it instead of failing the parse.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::Template;

/// Discriminant used to dispatch a generator entry to its implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeneratorKind {
    List,
    Clusters,
    Git,
}

impl GeneratorKind {
    pub const ALL: [GeneratorKind; 3] = [GeneratorKind::List, GeneratorKind::Clusters, GeneratorKind::Git];

    /// Key used for this kind in manifests.
    pub fn key(self) -> &'static str {
        match self {
            GeneratorKind::List => "list",
            GeneratorKind::Clusters => "clusters",
            GeneratorKind::Git => "git",
        }
    }

    /// Whether a manifest key names a known kind (accepts the `cluster` alias).
    pub fn is_known_key(key: &str) -> bool {
        key == "cluster" || Self::ALL.iter().any(|k| k.key() == key)
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.key()) }
}

/// Explicit list of parameter sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListGenerator {
    #[serde(default)]
    pub elements: Vec<Json>,
    #[serde(default, skip_serializing_if = "Template::is_empty")]
    pub template: Template,
}

/// Registered cluster inventory, filtered by label selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterGenerator {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Template::is_empty")]
    pub template: Template,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDirectory {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitFile {
    pub path: String,
}

/// Repository scan over directories or config files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitGenerator {
    #[serde(default, rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<GitDirectory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<GitFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Template::is_empty")]
    pub template: Template,
}

/// One entry of `spec.generators`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeneratorEntry", into = "GeneratorEntry")]
pub enum Generator {
    List(ListGenerator),
    Clusters(ClusterGenerator),
    Git(GitGenerator),
    /// No known kind key was present; the manifest key itself is not kept.
    Unrecognized,
}

impl Generator {
    pub fn kind(&self) -> Option<GeneratorKind> {
        match self {
            Generator::List(_) => Some(GeneratorKind::List),
            Generator::Clusters(_) => Some(GeneratorKind::Clusters),
            Generator::Git(_) => Some(GeneratorKind::Git),
            Generator::Unrecognized => None,
        }
    }

    pub fn is_unrecognized(&self) -> bool { matches!(self, Generator::Unrecognized) }

    /// Per-generator template override declared inline, if any.
    pub fn template(&self) -> Option<&Template> {
        match self {
            Generator::List(g) => Some(&g.template),
            Generator::Clusters(g) => Some(&g.template),
            Generator::Git(g) => Some(&g.template),
            Generator::Unrecognized => None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct GeneratorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list: Option<ListGenerator>,
    #[serde(default, alias = "cluster", skip_serializing_if = "Option::is_none")]
    clusters: Option<ClusterGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitGenerator>,
}

impl TryFrom<GeneratorEntry> for Generator {
    type Error = String;

    fn try_from(e: GeneratorEntry) -> Result<Self, Self::Error> {
        match (e.list, e.clusters, e.git) {
            (None, None, None) => Ok(Generator::Unrecognized),
            (Some(l), None, None) => Ok(Generator::List(l)),
            (None, Some(c), None) => Ok(Generator::Clusters(c)),
            (None, None, Some(g)) => Ok(Generator::Git(g)),
            _ => Err("generator entry sets more than one of list, clusters, git".to_string()),
        }
    }
}

impl From<Generator> for GeneratorEntry {
    fn from(g: Generator) -> Self {
        match g {
            Generator::List(l) => GeneratorEntry { list: Some(l), ..Default::default() },
            Generator::Clusters(c) => GeneratorEntry { clusters: Some(c), ..Default::default() },
            Generator::Git(g) => GeneratorEntry { git: Some(g), ..Default::default() },
            Generator::Unrecognized => GeneratorEntry::default(),
        }
    }
}
