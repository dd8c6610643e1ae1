//! Tunables for the scheduler and the instrumentation pass.

/// Worker-pool sizing. The specification fixes the pool at 4 OS threads;
/// this is kept overridable since the original `ThreadPool` constructor
/// already took `numThreads` as a parameter rather than hardcoding it.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
}

impl PoolConfig {
    /// The specification's fixed worker count.
    pub const DEFAULT_WORKER_COUNT: usize = 4;
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            worker_count: Self::DEFAULT_WORKER_COUNT,
        }
    }
}

/// Whether the instrumentation pass runs at all. There is deliberately no
/// knob for instrumentation *density* -- the specification's Non-goals
/// exclude optimizing instrumentation density, so the only choice offered
/// is on/off.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentationConfig {
    pub enabled: bool,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        InstrumentationConfig { enabled: true }
    }
}

/// Mirrors the host pass-manager's `enable-extract-loop-bodies` boolean
/// flag: loop extraction is off by default and must be explicitly enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineConfig {
    pub enable_extract_loop_bodies: bool,
    pub instrumentation: InstrumentationConfig,
}
