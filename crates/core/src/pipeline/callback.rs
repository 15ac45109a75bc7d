use std::collections::HashMap;

use candle_core::Tensor;

use super::request::CallbackTensor;
use crate::error::Result;

/// Named session tensors handed to a [`StepEndCallback`].
pub type CallbackTensors = HashMap<CallbackTensor, Tensor>;

/// Invoked after every scheduler step with the tensors the request asked
/// for. Tensors present in the returned map replace the session's copies.
pub trait StepEndCallback: Send + Sync {
    fn on_step_end(
        &self,
        step_index: usize,
        timestep: f64,
        tensors: CallbackTensors,
    ) -> Result<CallbackTensors>;
}

impl<F> StepEndCallback for F
where
    F: Fn(usize, f64, CallbackTensors) -> Result<CallbackTensors> + Send + Sync,
{
    fn on_step_end(
        &self,
        step_index: usize,
        timestep: f64,
        tensors: CallbackTensors,
    ) -> Result<CallbackTensors> {
        self(step_index, timestep, tensors)
    }
}
