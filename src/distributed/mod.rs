/// Execution contexts and collectives
///
/// An `ExecutionContext` tells the evaluator which rank it is and how to
/// combine values across ranks. `LocalContext` is the single-process identity;
/// `DistributedContext` delegates to a `Collective` transport.
pub mod tcp;
pub mod thread_group;

pub use tcp::TcpGroup;
pub use thread_group::ThreadGroup;

use std::sync::Arc;

use crate::Result;

/// Transport that can sum a vector elementwise across all participants
///
/// `all_reduce_sum` is a barrier: every participant must call it the same
/// number of times with equally long slices. On return each participant holds
/// the global sum. Failures (timeouts, length mismatch, lost peers) surface as
/// `EvalError::Collective` and leave the group unusable.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;
}

/// Rank identity plus cross-rank reduction
pub trait ExecutionContext: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sum `values` elementwise across ranks, in place
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Rank that prints progress and writes checkpoints
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// Single-process context; reduction is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalContext;

impl ExecutionContext for LocalContext {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

/// Multi-rank context backed by a collective transport
#[derive(Clone)]
pub struct DistributedContext {
    collective: Arc<dyn Collective>,
}

impl DistributedContext {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.collective.rank())
            .field("world_size", &self.collective.world_size())
            .finish()
    }
}

impl ExecutionContext for DistributedContext {
    fn rank(&self) -> usize {
        self.collective.rank()
    }

    fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        self.collective.all_reduce_sum(values)
    }
}
