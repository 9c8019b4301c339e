pub use hegn_core as core;
pub use hegn_dnn as dnn;
pub use hegn_registration as registration;

pub use hegn_core::{Error, Result};
pub use hegn_registration::{Hegn, HegnConfig, HegnLoss, HegnOutput, LossTerms};

/// Initialize a single global Rayon thread pool for all CPU-parallel routines.
///
/// Call this once at application startup before running the model.
/// Repeated calls are idempotent and return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `HEGN_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<()> {
    hegn_core::init_global_thread_pool(num_threads)
}
