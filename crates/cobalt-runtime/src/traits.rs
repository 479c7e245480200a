//! Compute backend capability
//!
//! The serving core never looks inside kernels. It hands a named operation
//! with its input and output slices to a backend together with the stream the
//! operation should run on, and gets back success or failure.

use cobalt_types::{Result, StreamId, TokenId};

/// One tensor operation of a transformer step.
///
/// Inputs are borrowed immutably, outputs mutably; the backend writes results
/// in place.
#[derive(Debug)]
pub enum ComputeOp<'a> {
    /// Token embedding lookup into `output` (hidden size)
    Embed {
        token: TokenId,
        output: &'a mut [f32],
    },
    /// Query/key/value projections of one hidden state
    Project {
        layer: usize,
        input: &'a [f32],
        query: &'a mut [f32],
        key: &'a mut [f32],
        value: &'a mut [f32],
    },
    /// Multi-head attention of one query over `keys.len() / query.len()` cached positions
    Attention {
        layer: usize,
        num_heads: usize,
        head_dim: usize,
        query: &'a [f32],
        keys: &'a [f32],
        values: &'a [f32],
        output: &'a mut [f32],
    },
    /// Feed-forward block applied in place, residual included
    FeedForward { layer: usize, hidden: &'a mut [f32] },
    /// Output-distribution scores over the vocabulary
    Logits {
        hidden: &'a [f32],
        logits: &'a mut [f32],
    },
}

impl ComputeOp<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            ComputeOp::Embed { .. } => "embed",
            ComputeOp::Project { .. } => "project",
            ComputeOp::Attention { .. } => "attention",
            ComputeOp::FeedForward { .. } => "feed_forward",
            ComputeOp::Logits { .. } => "logits",
        }
    }
}

/// An accelerator runtime able to run [`ComputeOp`]s on device streams.
pub trait ComputeBackend: Send + Sync {
    /// Backend name for logs and status reports
    fn name(&self) -> &str;

    /// Number of devices this backend can bind to
    fn device_count(&self) -> usize;

    /// Create a command stream on `device_id`
    fn create_stream(&self, device_id: u32) -> Result<StreamId>;

    /// Release a stream previously created on `device_id`
    fn destroy_stream(&self, device_id: u32, stream: StreamId) -> Result<()>;

    /// Execute `op` on `stream`, writing outputs in place
    fn execute(&self, op: ComputeOp<'_>, stream: StreamId) -> Result<()>;
}
