//! Interfaces to the execution collaborator
//!
//! The caches never run the model. They publish tensors into an
//! [`ExecutionRequest`] (the named input/output slot list of one graph run)
//! and query a [`ModelInfo`] for the inputs the loaded graph declares.

use super::config::{GeneratorParams, ModelConfig};
use crate::error::{Error, Result};
use crate::tensor::{KvRuntime, KvTensor, TensorAllocator};
use numr::dtype::DType;
use numr::runtime::Runtime;
use std::fmt;
use std::collections::HashMap;
use std::sync::Arc;

/// Named input and output slots of a graph run
pub trait ExecutionRequest<R: Runtime> {
    fn push_input(&mut self, name: &str, tensor: KvTensor<R>);
    fn push_output(&mut self, name: &str, tensor: KvTensor<R>);

    fn input_count(&self) -> usize;
    fn output_count(&self) -> usize;

    /// Replace the tensor bound at input `index`, keeping its name.
    fn set_input(&mut self, index: usize, tensor: KvTensor<R>) -> Result<()>;

    /// Replace the tensor bound at output `index`, keeping its name.
    fn set_output(&mut self, index: usize, tensor: KvTensor<R>) -> Result<()>;
}

/// One bound slot
#[derive(Clone)]
pub struct NamedSlot<R: Runtime> {
    pub name: String,
    pub tensor: KvTensor<R>,
}

impl<R: Runtime> fmt::Debug for NamedSlot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSlot")
            .field("name", &self.name)
            .field("tensor", &self.tensor)
            .finish()
    }
}

/// Plain in-memory [`ExecutionRequest`]
#[derive(Clone)]
pub struct SlotList<R: Runtime> {
    inputs: Vec<NamedSlot<R>>,
    outputs: Vec<NamedSlot<R>>,
}

impl<R: Runtime> Default for SlotList<R> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl<R: Runtime> fmt::Debug for SlotList<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotList")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl<R: Runtime> SlotList<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> &[NamedSlot<R>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NamedSlot<R>] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&KvTensor<R>> {
        self.inputs.iter().find(|s| s.name == name).map(|s| &s.tensor)
    }

    pub fn output(&self, name: &str) -> Option<&KvTensor<R>> {
        self.outputs.iter().find(|s| s.name == name).map(|s| &s.tensor)
    }
}

fn rebind<R: Runtime>(
    slots: &mut [NamedSlot<R>],
    index: usize,
    tensor: KvTensor<R>,
    kind: &str,
) -> Result<()> {
    let count = slots.len();
    let slot = slots.get_mut(index).ok_or_else(|| Error::InvalidArgument {
        arg: "index",
        reason: format!("{kind} slot {index} out of range for {count} slots"),
    })?;
    slot.tensor = tensor;
    Ok(())
}

impl<R: Runtime> ExecutionRequest<R> for SlotList<R> {
    fn push_input(&mut self, name: &str, tensor: KvTensor<R>) {
        self.inputs.push(NamedSlot {
            name: name.to_string(),
            tensor,
        });
    }

    fn push_output(&mut self, name: &str, tensor: KvTensor<R>) {
        self.outputs.push(NamedSlot {
            name: name.to_string(),
            tensor,
        });
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn set_input(&mut self, index: usize, tensor: KvTensor<R>) -> Result<()> {
        rebind(&mut self.inputs, index, tensor, "input")
    }

    fn set_output(&mut self, index: usize, tensor: KvTensor<R>) -> Result<()> {
        rebind(&mut self.outputs, index, tensor, "output")
    }
}

/// What the loaded graph declares about its inputs
pub trait ModelInfo {
    fn has_input(&self, name: &str) -> bool;

    /// Declared element type of input `name`.
    fn input_dtype(&self, name: &str) -> Result<DType>;
}

/// Map-backed [`ModelInfo`]
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    inputs: HashMap<String, DType>,
}

impl SessionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, dtype: DType) -> Self {
        self.add_input(name, dtype);
        self
    }

    pub fn add_input(&mut self, name: impl Into<String>, dtype: DType) {
        self.inputs.insert(name.into(), dtype);
    }
}

impl ModelInfo for SessionInfo {
    fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    fn input_dtype(&self, name: &str) -> Result<DType> {
        self.inputs
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidConfig {
                reason: format!("session declares no input named '{name}'"),
            })
    }
}

/// Everything a cache needs at construction
pub struct CacheContext<'a, R: KvRuntime> {
    pub model: &'a ModelConfig,
    pub params: &'a GeneratorParams,
    pub session: &'a dyn ModelInfo,
    pub allocator: Arc<dyn TensorAllocator<R>>,
}

impl<R: KvRuntime> Clone for CacheContext<'_, R> {
    fn clone(&self) -> Self {
        Self {
            model: self.model,
            params: self.params,
            session: self.session,
            allocator: self.allocator.clone(),
        }
    }
}

impl<'a, R: KvRuntime> CacheContext<'a, R> {
    pub fn new(
        model: &'a ModelConfig,
        params: &'a GeneratorParams,
        session: &'a dyn ModelInfo,
        allocator: Arc<dyn TensorAllocator<R>>,
    ) -> Self {
        Self {
            model,
            params,
            session,
            allocator,
        }
    }

    /// Validate the model and generation settings together.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.params.validate(self.model)
    }
}
