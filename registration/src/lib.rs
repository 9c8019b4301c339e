//! HEGN point cloud registration
//!
//! This crate provides the 9-DoF registration pipeline and its baselines:
//! - HEGN: hierarchical equivariant feature extraction, cross/global context,
//!   invariant subset selection and closed-form SVD alignment
//! - the composite registration + chamfer training loss
//! - point-to-point ICP
//! - an evaluation loop shared by every registrar

pub mod config;
pub mod eval;
pub mod hegn;
pub mod icp;

pub use config::HegnConfig;
pub use eval::{evaluate, rmse, EvalConfig, EvalReport, HegnRegistrar, IcpRegistrar, Registrar};
pub use hegn::alignment::{estimate_translation, Alignment, AlignmentSolver, TranslationPolicy};
pub use hegn::context::{CrossContext, GlobalContext};
pub use hegn::hierarchy::{FeatureExtraction, HierarchicalAggregation};
pub use hegn::invariant::{
    invariant_descriptor, invariant_scores, selection_count, InvariantMapping,
};
pub use hegn::loss::{HegnLoss, LossInputs, LossTerms};
pub use hegn::model::{BlockSummary, Hegn, HegnOutput};
pub use icp::{registration_icp_point_to_point, IcpOptions, IcpResult};

pub use hegn_core::{Error, Result};
