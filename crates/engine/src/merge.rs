use appset_core::{spec_is_empty, Template};

/// Overlay a generator's template on the set's base template.
///
/// Name and namespace come from the override when non-empty. Labels are unioned with the
/// override winning on collisions. A non-empty override spec replaces the base spec as a
/// whole; there is no deep merge of the spec payload.
pub fn merge_template(base: &Template, overlay: &Template) -> Template {
    let mut merged = base.clone();
    if !overlay.metadata.name.is_empty() {
        merged.metadata.name = overlay.metadata.name.clone();
    }
    if !overlay.metadata.namespace.is_empty() {
        merged.metadata.namespace = overlay.metadata.namespace.clone();
    }
    merged
        .metadata
        .labels
        .extend(overlay.metadata.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    if !spec_is_empty(&overlay.spec) {
        merged.spec = overlay.spec.clone();
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_core::TemplateMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn base() -> Template {
        Template {
            metadata: TemplateMeta {
                name: "name".into(),
                namespace: "namespace".into(),
                labels: labels(&[("label_name", "label_value")]),
            },
            spec: json!({"project": "default", "source": {"path": "base"}}),
        }
    }

    #[test]
    fn empty_override_is_identity() {
        assert_eq!(merge_template(&base(), &Template::default()), base());
    }

    #[test]
    fn override_name_and_labels_win() {
        let overlay = Template {
            metadata: TemplateMeta {
                name: "test".into(),
                namespace: String::new(),
                labels: labels(&[("foo", "bar"), ("label_name", "overridden")]),
            },
            spec: json!({}),
        };
        let merged = merge_template(&base(), &overlay);
        assert_eq!(merged.metadata.name, "test");
        assert_eq!(merged.metadata.namespace, "namespace");
        assert_eq!(merged.metadata.labels, labels(&[("foo", "bar"), ("label_name", "overridden")]));
        // `{}` counts as no spec, so the base spec survives.
        assert_eq!(merged.spec, base().spec);
    }

    #[test]
    fn non_empty_override_spec_replaces_wholesale() {
        let overlay = Template { spec: json!({"project": "other"}), ..Default::default() };
        let merged = merge_template(&base(), &overlay);
        assert_eq!(merged.spec, json!({"project": "other"}));
        assert_eq!(merged.metadata, base().metadata);
    }
}
