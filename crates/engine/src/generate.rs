use std::sync::Arc;
use std::time::Duration;

use appset_core::{Application, ApplicationSet};
use tracing::debug;

use crate::generators::GeneratorRegistry;
use crate::merge::merge_template;
use crate::render::Renderer;
use crate::EngineError;

/// Expands an ApplicationSet into its desired Applications.
#[derive(Clone)]
pub struct AppGenerator {
    generators: GeneratorRegistry,
    renderer: Arc<dyn Renderer>,
}

impl AppGenerator {
    pub fn new(generators: GeneratorRegistry, renderer: Arc<dyn Renderer>) -> Self {
        Self { generators, renderer }
    }

    /// Render every parameter mapping of every generator, in declaration order.
    ///
    /// Fails fast: the first expansion or render error is returned and no Applications
    /// are. Unrecognized entries are skipped here; they are reported by validation.
    pub async fn generate_applications(&self, set: &ApplicationSet) -> Result<Vec<Application>, EngineError> {
        let mut out = Vec::new();
        for (index, entry) in set.spec.generators.iter().enumerate() {
            let kind = match entry.kind() {
                Some(kind) => kind,
                None => {
                    debug!(set = %set.name(), index, "skipping unrecognized generator");
                    continue;
                }
            };
            let generator = self.generators.get(kind).ok_or(EngineError::UnknownGeneratorKind(kind))?;
            let params = generator
                .generate_params(entry)
                .await
                .map_err(|source| EngineError::GeneratorExpansionFailed { kind, source })?;
            let template = merge_template(&set.spec.template, &generator.template(entry)).to_application();
            for p in &params {
                let app = self
                    .renderer
                    .render(&template, p)
                    .map_err(|source| EngineError::RenderFailed { kind, source })?;
                out.push(app);
            }
            debug!(set = %set.name(), index, kind = %kind, params = params.len(), "generator expanded");
        }
        Ok(out)
    }

    /// Shortest requeue interval any generator asks for; `None` when none polls.
    pub fn min_requeue_after(&self, set: &ApplicationSet) -> Option<Duration> {
        set.spec
            .generators
            .iter()
            .filter_map(|entry| {
                let generator = self.generators.get(entry.kind()?)?;
                generator.requeue_after(entry)
            })
            .min()
    }
}
