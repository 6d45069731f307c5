//! ApplicationSet engine: expand generators into Applications and keep a store in line with them.

#![forbid(unsafe_code)]

mod error;
pub mod generate;
pub mod generators;
mod merge;
pub mod reconcile;
pub mod render;
pub mod sync;
pub mod validate;

pub use error::EngineError;
pub use generate::AppGenerator;
pub use generators::{GeneratorRegistry, ListParamGenerator, ParamGenerator, NO_REQUEUE_AFTER};
pub use merge::merge_template;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use render::{PlaceholderRenderer, Renderer};
pub use sync::{create_in_cluster, create_or_update_in_cluster, delete_in_cluster, update_with_token, SyncStats};
pub use validate::{check_invalid_generators, duplicate_name, invalid_generators, unrecognized_generators_message};
