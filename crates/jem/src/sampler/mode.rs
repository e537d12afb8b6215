//! Scoped sampling mode for an [`EnergyModel`].
//!
//! While a [`SamplingMode`] is alive the model runs in evaluation mode with
//! every parameter detached from gradient tracking, so a backward pass only
//! produces input gradients. Dropping the guard restores each parameter's
//! previous `require_grad` flag and the previous training flag, on normal
//! return and on early `?` exits alike.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;

use burn::module::{ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;

use crate::model::energy::EnergyModel;

/// Records the `require_grad` flag of every float parameter.
#[derive(Default)]
pub(crate) struct RequireGradFlags {
    pub(crate) flags: HashMap<ParamId, bool>,
}

impl<B: Backend> ModuleVisitor<B> for RequireGradFlags {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.flags.insert(id, tensor.is_require_grad());
    }
}

/// Capture the current `require_grad` flag of every parameter in `model`.
pub fn require_grad_flags<B: Backend, M: Module<B>>(model: &M) -> HashMap<ParamId, bool> {
    let mut visitor = RequireGradFlags::default();
    model.visit(&mut visitor);
    visitor.flags
}

struct FreezeParams;

impl<B: Backend> ModuleMapper<B> for FreezeParams {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        tensor.set_require_grad(false)
    }
}

struct RestoreParams<'a> {
    flags: &'a HashMap<ParamId, bool>,
}

impl<B: Backend> ModuleMapper<B> for RestoreParams<'_> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.flags.get(&id) {
            Some(&flag) => tensor.set_require_grad(flag),
            None => tensor,
        }
    }
}

/// Guard returned by [`SamplingMode::enter`]; derefs to the frozen model.
pub struct SamplingMode<'a, B: Backend, M: EnergyModel<B>> {
    model: &'a mut M,
    prior_require_grad: HashMap<ParamId, bool>,
    prior_training: bool,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend, M: EnergyModel<B>> SamplingMode<'a, B, M> {
    /// Freeze `model` parameters and switch it to evaluation mode.
    pub fn enter(model: &'a mut M) -> Self {
        let prior_require_grad = require_grad_flags(&*model);
        let prior_training = model.is_training();
        *model = model.clone().map(&mut FreezeParams).set_training(false);
        tracing::trace!(
            params = prior_require_grad.len(),
            prior_training,
            "Entered sampling mode"
        );
        Self {
            model,
            prior_require_grad,
            prior_training,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend, M: EnergyModel<B>> Deref for SamplingMode<'_, B, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<B: Backend, M: EnergyModel<B>> Drop for SamplingMode<'_, B, M> {
    fn drop(&mut self) {
        let mut restore = RestoreParams {
            flags: &self.prior_require_grad,
        };
        *self.model = self
            .model
            .clone()
            .map(&mut restore)
            .set_training(self.prior_training);
        tracing::trace!(prior_training = self.prior_training, "Left sampling mode");
    }
}
