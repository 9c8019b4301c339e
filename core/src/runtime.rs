use crate::{Error, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;

static THREAD_POOL_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

const THREADS_ENV: &str = "HEGN_CPU_THREADS";

/// Where the forward pass runs.
///
/// Batch elements and per-point searches are spread over a rayon pool:
/// either the global one or a pool owned by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    CpuThreads(usize),
}

impl Device {
    /// Build the dedicated pool for `CpuThreads`; `Cpu` uses the global pool.
    pub fn thread_pool(&self) -> Result<Option<ThreadPool>> {
        match *self {
            Device::Cpu => Ok(None),
            Device::CpuThreads(0) => Err(Error::ConfigError(
                "device thread count must be >= 1".into(),
            )),
            Device::CpuThreads(n) => ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("hegn-worker-{i}"))
                .build()
                .map(Some)
                .map_err(|e| Error::RuntimeError(e.to_string())),
        }
    }
}

/// Initialize the global Rayon thread pool used by CPU-parallel routines.
///
/// Priority:
/// 1. `num_threads` argument
/// 2. `HEGN_CPU_THREADS` environment variable
/// 3. Rayon default
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<()> {
    let res = THREAD_POOL_INIT.get_or_init(|| {
        let configured_threads = match num_threads {
            Some(n) => Some(n),
            None => read_cpu_threads_from_env()?,
        };

        let mut builder = ThreadPoolBuilder::new();
        if let Some(n) = configured_threads {
            if n == 0 {
                return Err(format!("{THREADS_ENV} must be >= 1"));
            }
            builder = builder.num_threads(n);
        }

        builder.build_global().map_err(|e| e.to_string())
    });
    res.clone().map_err(Error::RuntimeError)
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

fn read_cpu_threads_from_env() -> std::result::Result<Option<usize>, String> {
    let raw = match env::var(THREADS_ENV) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => return Err(format!("failed to read {THREADS_ENV}: {e}")),
    };

    let parsed: usize = raw
        .parse()
        .map_err(|_| format!("{THREADS_ENV} must be a positive integer, got '{raw}'"))?;
    if parsed == 0 {
        return Err(format!("{THREADS_ENV} must be >= 1"));
    }
    Ok(Some(parsed))
}
