use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use candle_core::{IndexOp, Tensor};
use tracing::trace;

use super::hook::{AttentionHook, BlockFamily};
use crate::config::TransformerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Retained entries for the double-stream family.
    pub capacity_double: usize,
    /// Retained entries for the single-stream family.
    pub capacity_single: usize,
    /// Average over heads at capture time, keeping a size-1 head axis.
    pub average_heads: bool,
}

impl RecorderConfig {
    /// Keeps exactly one forward pass worth of entries per family.
    pub fn for_model(config: &TransformerConfig) -> Self {
        Self {
            capacity_double: config.depth,
            capacity_single: config.depth_single_blocks,
            average_heads: true,
        }
    }
}

/// The most recent entries of both families, oldest first.
#[derive(Debug, Clone)]
pub struct CapturedPass {
    pub double: Vec<Tensor>,
    pub single: Vec<Tensor>,
}

#[derive(Default)]
struct Buffers {
    double: VecDeque<Tensor>,
    single: VecDeque<Tensor>,
}

impl Buffers {
    fn family_mut(&mut self, family: BlockFamily) -> &mut VecDeque<Tensor> {
        match family {
            BlockFamily::DoubleStream => &mut self.double,
            BlockFamily::SingleStream => &mut self.single,
        }
    }

    fn family(&self, family: BlockFamily) -> &VecDeque<Tensor> {
        match family {
            BlockFamily::DoubleStream => &self.double,
            BlockFamily::SingleStream => &self.single,
        }
    }
}

/// Records attention weights into bounded per-family ring buffers.
///
/// Each session gets its own recorder; it is dropped together with the
/// driver that owns it.
pub struct AttentionRecorder {
    config: RecorderConfig,
    buffers: Mutex<Buffers>,
}

impl AttentionRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn for_model(config: &TransformerConfig) -> Self {
        Self::new(RecorderConfig::for_model(config))
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn lock(&self) -> candle_core::Result<MutexGuard<'_, Buffers>> {
        self.buffers
            .lock()
            .map_err(|_| candle_core::Error::Msg("attention recorder lock poisoned".into()))
    }

    fn capacity(&self, family: BlockFamily) -> usize {
        match family {
            BlockFamily::DoubleStream => self.config.capacity_double,
            BlockFamily::SingleStream => self.config.capacity_single,
        }
    }

    pub fn len(&self, family: BlockFamily) -> usize {
        self.lock().map(|b| b.family(family).len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len(BlockFamily::DoubleStream) == 0 && self.len(BlockFamily::SingleStream) == 0
    }

    pub fn clear(&self) -> candle_core::Result<()> {
        let mut buffers = self.lock()?;
        buffers.double.clear();
        buffers.single.clear();
        Ok(())
    }

    /// Removes and returns the newest `n_double` and `n_single` entries.
    ///
    /// Returns `None`, leaving the buffers untouched, when either family
    /// holds fewer entries than requested.
    pub fn drain_latest(
        &self,
        n_double: usize,
        n_single: usize,
    ) -> candle_core::Result<Option<CapturedPass>> {
        let mut buffers = self.lock()?;
        if buffers.double.len() < n_double || buffers.single.len() < n_single {
            return Ok(None);
        }
        let double_start = buffers.double.len() - n_double;
        let single_start = buffers.single.len() - n_single;
        let double: Vec<Tensor> = buffers.double.drain(double_start..).collect();
        let single: Vec<Tensor> = buffers.single.drain(single_start..).collect();
        Ok(Some(CapturedPass { double, single }))
    }

    /// Drains one full forward pass as sized by the capacities.
    pub fn drain_pass(&self) -> candle_core::Result<Option<CapturedPass>> {
        self.drain_latest(self.config.capacity_double, self.config.capacity_single)
    }
}

impl AttentionHook for AttentionRecorder {
    fn capture_enabled(&self, family: BlockFamily) -> bool {
        self.capacity(family) > 0
    }

    fn on_attention(
        &self,
        family: BlockFamily,
        block_index: usize,
        weights: &Tensor,
    ) -> candle_core::Result<()> {
        let capacity = self.capacity(family);
        if capacity == 0 {
            return Ok(());
        }
        // Only the first batch element is visualized.
        let entry = weights.i(0)?;
        let entry = if self.config.average_heads {
            entry.mean_keepdim(0)?
        } else {
            entry.contiguous()?
        };
        trace!(%family, block_index, shape = ?entry.dims(), "captured attention");

        let mut buffers = self.lock()?;
        let buffer = buffers.family_mut(family);
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
        Ok(())
    }
}
