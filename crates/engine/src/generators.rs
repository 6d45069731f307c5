//! Generator capabilities: turn one generator entry into parameter mappings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use appset_core::{Generator, GeneratorKind, Params, Template};
use serde_json::Value as Json;

/// Requeue sentinel: the generator has nothing to poll.
pub const NO_REQUEUE_AFTER: Option<Duration> = None;

#[async_trait::async_trait]
pub trait ParamGenerator: Send + Sync {
    /// Parameter mappings for this entry, in the order Applications should be rendered.
    async fn generate_params(&self, generator: &Generator) -> Result<Vec<Params>>;

    /// Template overlay for this entry; an empty template when none is declared.
    fn template(&self, generator: &Generator) -> Template {
        generator.template().cloned().unwrap_or_default()
    }

    /// How soon this entry wants to be re-evaluated, or [`NO_REQUEUE_AFTER`].
    fn requeue_after(&self, generator: &Generator) -> Option<Duration>;
}

/// Kind -> implementation lookup used for dispatch.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    by_kind: HashMap<GeneratorKind, Arc<dyn ParamGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry with the generators this crate ships (currently `list`).
    pub fn with_defaults() -> Self {
        Self::new().with(GeneratorKind::List, Arc::new(ListParamGenerator))
    }

    pub fn with(mut self, kind: GeneratorKind, generator: Arc<dyn ParamGenerator>) -> Self {
        self.by_kind.insert(kind, generator);
        self
    }

    pub fn get(&self, kind: GeneratorKind) -> Option<&Arc<dyn ParamGenerator>> {
        self.by_kind.get(&kind)
    }
}

/// `list` generator: each element object is one parameter mapping.
pub struct ListParamGenerator;

fn param_value(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl ParamGenerator for ListParamGenerator {
    async fn generate_params(&self, generator: &Generator) -> Result<Vec<Params>> {
        let list = match generator {
            Generator::List(list) => list,
            other => return Err(anyhow!("list generator handed a {:?} entry", other.kind())),
        };
        list.elements
            .iter()
            .enumerate()
            .map(|(i, element)| {
                let obj = element.as_object().ok_or_else(|| anyhow!("list element {} is not an object", i))?;
                let params: Params = obj.iter().map(|(k, v)| (k.clone(), param_value(v))).collect();
                Ok(params)
            })
            .collect()
    }

    fn requeue_after(&self, _generator: &Generator) -> Option<Duration> { NO_REQUEUE_AFTER }
}
