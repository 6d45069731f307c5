use std::sync::Arc;
use std::time::{Duration, Instant};

use appset_core::{Application, ApplicationSet, SyncPolicy};
use appset_store::AppStore;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::generate::AppGenerator;
use crate::sync::{create_in_cluster, create_or_update_in_cluster, delete_in_cluster, SyncStats};
use crate::validate::{check_invalid_generators, duplicate_name};
use crate::EngineError;

/// Result of one pass over one ApplicationSet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub desired: Vec<Application>,
    pub stats: SyncStats,
    /// Shortest interval any generator asked for; `None` means no generator polls.
    #[serde(with = "secs_opt")]
    pub requeue_after: Option<Duration>,
}

mod secs_opt {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

/// One reconcile pass: validate, expand, guard, synchronize.
///
/// Passes over the same set must be serialized by the caller; the store token only
/// detects a racing writer.
pub struct Reconciler {
    generator: AppGenerator,
    store: Arc<dyn AppStore>,
    default_policy: SyncPolicy,
}

impl Reconciler {
    pub fn new(generator: AppGenerator, store: Arc<dyn AppStore>) -> Self {
        Self { generator, store, default_policy: SyncPolicy::default() }
    }

    /// Policy for sets that do not declare `spec.syncPolicy`.
    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn policy_for(&self, set: &ApplicationSet) -> SyncPolicy {
        set.spec.sync_policy.unwrap_or(self.default_policy)
    }

    #[tracing::instrument(skip_all, fields(set = %set.name(), namespace = %set.namespace()))]
    pub async fn reconcile(&self, set: &ApplicationSet) -> Result<ReconcileOutcome, EngineError> {
        let t0 = Instant::now();
        let res = self.pass(set).await;
        histogram!("appset_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(out) => info!(
                desired = out.desired.len(),
                created = out.stats.created,
                updated = out.stats.updated,
                deleted = out.stats.deleted,
                requeue_after = ?out.requeue_after,
                "reconcile done"
            ),
            Err(e) => {
                counter!("appset_reconcile_err", 1u64);
                warn!(error = %e, retryable = e.is_retryable(), "reconcile failed");
            }
        }
        res
    }

    async fn pass(&self, set: &ApplicationSet) -> Result<ReconcileOutcome, EngineError> {
        check_invalid_generators(set);
        let desired = self.generator.generate_applications(set).await?;
        if let Some(name) = duplicate_name(&desired) {
            return Err(EngineError::DuplicateDesiredName(name.to_string()));
        }

        let store = self.store.as_ref();
        let policy = self.policy_for(set);
        let mut stats = if policy.updates() {
            create_or_update_in_cluster(store, set, &desired).await?
        } else {
            create_in_cluster(store, set, &desired).await?
        };
        if policy.deletes() {
            stats = stats + delete_in_cluster(store, set, &desired).await?;
        }

        Ok(ReconcileOutcome { desired, stats, requeue_after: self.generator.min_requeue_after(set) })
    }
}
