use candle_core::Tensor;
use serde::Serialize;

/// The two transformer block kinds, captured into separate buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFamily {
    /// Joint blocks with separate text and image streams.
    DoubleStream,
    /// Blocks over the concatenated text+image sequence.
    SingleStream,
}

impl BlockFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DoubleStream => "double_stream",
            Self::SingleStream => "single_stream",
        }
    }
}

impl std::fmt::Display for BlockFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of post-softmax attention weights.
///
/// The transformer asks `capture_enabled` before each block and only then
/// materializes the `(batch, heads, seq, seq)` weights and hands them to
/// `on_attention`. The sequence is text tokens first, image tokens after.
pub trait AttentionHook: Send + Sync {
    fn capture_enabled(&self, family: BlockFamily) -> bool;

    fn on_attention(
        &self,
        family: BlockFamily,
        block_index: usize,
        weights: &Tensor,
    ) -> candle_core::Result<()>;
}
