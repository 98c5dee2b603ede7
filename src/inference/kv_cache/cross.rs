//! Cross-attention cache
//!
//! Holds the key/value projections of the encoder output. The encoder pass
//! writes them once through [`CrossCache::add_outputs`]; every decoder pass
//! reads the same tensors through [`CrossCache::add_inputs`].

use crate::error::Result;
use crate::inference::names::compose_layer_names;
use crate::inference::session::{CacheContext, ExecutionRequest};
use crate::tensor::{KvRuntime, KvTensor};

pub struct CrossCache<R: KvRuntime> {
    shape: [usize; 4],
    input_names: Vec<String>,
    output_names: Vec<String>,
    values: Vec<KvTensor<R>>,
}

impl<R: KvRuntime> CrossCache<R> {
    pub fn new(ctx: &CacheContext<'_, R>) -> Result<Self> {
        ctx.validate()?;
        let decoder = &ctx.model.decoder;
        let layers = decoder.num_hidden_layers;

        let mut input_names = Vec::with_capacity(2 * layers);
        let mut output_names = Vec::with_capacity(2 * layers);
        let names = [
            compose_layer_names(&decoder.inputs.cross_past_key_names, layers)?,
            compose_layer_names(&decoder.inputs.cross_past_value_names, layers)?,
            compose_layer_names(&decoder.outputs.cross_present_key_names, layers)?,
            compose_layer_names(&decoder.outputs.cross_present_value_names, layers)?,
        ];
        for i in 0..layers {
            input_names.extend([names[0][i].clone(), names[1][i].clone()]);
            output_names.extend([names[2][i].clone(), names[3][i].clone()]);
        }

        let dtype = ctx.session.input_dtype(&input_names[0])?;
        let shape = [
            ctx.params.batch_beam_size(),
            decoder.num_key_value_heads,
            decoder.cross_attention_length,
            decoder.head_size,
        ];
        let values = (0..2 * layers)
            .map(|_| ctx.allocator.create_tensor(&shape, dtype))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(layers, ?shape, ?dtype, "cross attention cache allocated");

        Ok(Self {
            shape,
            input_names,
            output_names,
            values,
        })
    }

    /// Register the tensors as encoder outputs.
    pub fn add_outputs(&self, request: &mut dyn ExecutionRequest<R>) {
        for (name, value) in self.output_names.iter().zip(&self.values) {
            request.push_output(name, value.clone());
        }
    }

    /// Register the same tensors as decoder inputs.
    pub fn add_inputs(&self, request: &mut dyn ExecutionRequest<R>) {
        for (name, value) in self.input_names.iter().zip(&self.values) {
            request.push_input(name, value.clone());
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[KvTensor<R>] {
        &self.values
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn layer_count(&self) -> usize {
        self.values.len() / 2
    }
}
