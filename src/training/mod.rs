//! Training-loop facing gradient preparation.
//!
//! Components:
//! - Optimizer parameter groups (`optimizer`)
//! - The per-step sync pipeline: SP reduce, DP bucketed reduce, clip (`grad_sync`)

pub mod grad_sync;
pub mod optimizer;

pub use grad_sync::{prepare_gradients, GradSyncReport};
pub use optimizer::{ParamGroup, ParameterGroups};
