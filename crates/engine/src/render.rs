//! Renderers turn an unrendered Application plus one parameter mapping into a concrete one.

use anyhow::{bail, Context, Result};
use appset_core::{Application, Params};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value as Json;

pub trait Renderer: Send + Sync {
    fn render(&self, template: &Application, params: &Params) -> Result<Application>;
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex"));

/// `{{key}}` substitution over every string (and object key) of the template.
///
/// Unknown placeholders are left as written unless the renderer is strict.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer {
    strict: bool,
}

impl PlaceholderRenderer {
    pub fn new() -> Self { Self::default() }

    /// Fail the render when a placeholder has no matching parameter.
    pub fn strict() -> Self { Self { strict: true } }

    fn substitute(&self, s: &str, params: &Params) -> Result<String> {
        if !s.contains("{{") {
            return Ok(s.to_string());
        }
        let mut missing: Option<String> = None;
        let out = PLACEHOLDER.replace_all(s, |caps: &Captures| match params.get(&caps[1]) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                caps[0].to_string()
            }
        });
        if self.strict {
            if let Some(key) = missing {
                bail!("no parameter named {:?}", key);
            }
        }
        Ok(out.into_owned())
    }

    fn walk(&self, v: &mut Json, params: &Params) -> Result<()> {
        match v {
            Json::String(s) => *s = self.substitute(s, params)?,
            Json::Array(items) => {
                for item in items.iter_mut() {
                    self.walk(item, params)?;
                }
            }
            Json::Object(map) => {
                let entries = std::mem::take(map);
                for (k, mut val) in entries {
                    self.walk(&mut val, params)?;
                    map.insert(self.substitute(&k, params)?, val);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Renderer for PlaceholderRenderer {
    fn render(&self, template: &Application, params: &Params) -> Result<Application> {
        let mut raw = serde_json::to_value(template).context("serializing template")?;
        self.walk(&mut raw, params)?;
        let mut app: Application = serde_json::from_value(raw).context("decoding rendered application")?;
        app.ensure_type_meta();
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_core::{Template, TemplateMeta};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn template() -> Application {
        Template {
            metadata: TemplateMeta {
                name: "{{cluster}}-guestbook".into(),
                namespace: "argocd".into(),
                labels: BTreeMap::from([("env".to_string(), "{{ env }}".to_string())]),
            },
            spec: json!({
                "project": "default",
                "destination": {"server": "{{url}}", "namespace": "guestbook"},
                "source": {"path": "overlays/{{env}}", "helm": {"values": ["{{cluster}}.yaml"]}}
            }),
        }
        .to_application()
    }

    #[test]
    fn substitutes_metadata_and_spec() {
        let p = params(&[("cluster", "dev"), ("url", "https://1.2.3.4"), ("env", "staging")]);
        let app = PlaceholderRenderer::new().render(&template(), &p).unwrap();
        assert_eq!(app.name(), "dev-guestbook");
        assert_eq!(app.namespace(), "argocd");
        assert_eq!(app.metadata.labels.as_ref().unwrap()["env"], "staging");
        assert_eq!(app.spec["destination"]["server"], "https://1.2.3.4");
        assert_eq!(app.spec["source"]["path"], "overlays/staging");
        assert_eq!(app.spec["source"]["helm"]["values"][0], "dev.yaml");
        assert_eq!(app.kind, "Application");
    }

    #[test]
    fn unknown_placeholder_is_kept_unless_strict() {
        let p = params(&[("cluster", "dev")]);
        let app = PlaceholderRenderer::new().render(&template(), &p).unwrap();
        assert_eq!(app.spec["destination"]["server"], "{{url}}");

        let err = PlaceholderRenderer::strict().render(&template(), &p).unwrap_err();
        assert!(err.to_string().contains("url") || err.to_string().contains("env"), "err={}", err);
    }

    #[test]
    fn keys_are_rendered_too() {
        let mut tmpl = Application::new("ns", "app");
        tmpl.spec = json!({"parameters": {"{{key}}": "{{value}}"}});
        let app = PlaceholderRenderer::new().render(&tmpl, &params(&[("key", "replicas"), ("value", "2")])).unwrap();
        assert_eq!(app.spec, json!({"parameters": {"replicas": "2"}}));
    }
}
