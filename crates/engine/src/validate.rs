//! Generator validity diagnostics and the duplicate-name guard.

use std::collections::{BTreeSet, HashSet};

use appset_core::{Application, ApplicationSet, GeneratorKind};
use serde_json::Value as Json;
use tracing::warn;

/// Whether any generator entry has no recognized kind, plus the unknown kind names that
/// could be recovered from the last-applied snapshot.
///
/// Recovery never fails: a missing or malformed snapshot yields an empty set.
pub fn invalid_generators(set: &ApplicationSet) -> (bool, BTreeSet<String>) {
    let has_invalid = set.spec.generators.iter().any(|g| g.is_unrecognized());
    (has_invalid, recover_unknown_kinds(set))
}

fn recover_unknown_kinds(set: &ApplicationSet) -> BTreeSet<String> {
    let raw = match set.last_applied_configuration() {
        Some(raw) => raw,
        None => return BTreeSet::new(),
    };
    let doc: Json = match serde_json::from_str(raw) {
        Ok(doc) => doc,
        Err(_) => return BTreeSet::new(),
    };
    let entries = match doc.pointer("/spec/generators").and_then(Json::as_array) {
        Some(entries) => entries,
        None => return BTreeSet::new(),
    };
    entries
        .iter()
        .filter_map(Json::as_object)
        .flat_map(|entry| entry.keys())
        .filter(|key| !GeneratorKind::is_known_key(key))
        .cloned()
        .collect()
}

/// Warning text for a set carrying unrecognized generators; `None` when all are recognized.
pub fn unrecognized_generators_message(set: &ApplicationSet) -> Option<String> {
    let (has_invalid, names) = invalid_generators(set);
    if !has_invalid {
        return None;
    }
    let mut msg = format!("ApplicationSet {} contains unrecognized generators", set.name());
    if !names.is_empty() {
        msg.push_str(": ");
        msg.push_str(&names.into_iter().collect::<Vec<_>>().join(", "));
    }
    Some(msg)
}

/// Log one warning if the set carries unrecognized generators. Returns whether it did.
pub fn check_invalid_generators(set: &ApplicationSet) -> bool {
    match unrecognized_generators_message(set) {
        Some(msg) => {
            warn!(set = %set.name(), namespace = %set.namespace(), "{}", msg);
            true
        }
        None => false,
    }
}

/// First name that occurs twice in `desired`, scanning in order.
pub fn duplicate_name(desired: &[Application]) -> Option<&str> {
    let mut seen = HashSet::new();
    desired.iter().map(Application::name).find(|name| !seen.insert(*name))
}
