//! Combined key/value cache
//!
//! One tensor per layer with key and value stacked on a leading axis:
//! `[2, batch × beam, kv_heads, sequence, head_size]`.

use super::beam::{BeamLayout, gather_beams};
use super::{BoundSlots, KeyValueCache, KvElement, check_beam_request, require_bound};
use crate::error::Result;
use crate::inference::names::compose_layer_names;
use crate::inference::session::{CacheContext, ExecutionRequest};
use crate::ops::{CopyOps, select_copy_ops};
use crate::tensor::{KvRuntime, KvTensor, TensorAllocator};
use std::sync::Arc;

const CACHE_NAME: &str = "combined kv cache";

pub struct CombinedKvCache<R: KvRuntime> {
    allocator: Arc<dyn TensorAllocator<R>>,
    copy: Arc<dyn CopyOps<R>>,
    element: KvElement,
    beam_width: usize,
    /// Shape of the next present; the sequence axis tracks the decode length
    shape: [usize; 5],
    input_names: Vec<String>,
    output_names: Vec<String>,
    pasts: Vec<KvTensor<R>>,
    presents: Vec<KvTensor<R>>,
    slots: Option<BoundSlots>,
}

impl<R: KvRuntime> CombinedKvCache<R> {
    pub fn new(ctx: &CacheContext<'_, R>) -> Result<Self> {
        ctx.validate()?;
        let decoder = &ctx.model.decoder;
        let layers = decoder.num_hidden_layers;
        let input_names = compose_layer_names(&decoder.inputs.past_names, layers)?;
        let output_names = compose_layer_names(&decoder.outputs.present_names, layers)?;
        let element = KvElement::from_dtype(ctx.session.input_dtype(&input_names[0])?, CACHE_NAME)?;
        let copy = select_copy_ops(ctx.allocator.as_ref());

        let mut shape = [
            2,
            ctx.params.batch_beam_size(),
            decoder.num_key_value_heads,
            0,
            decoder.head_size,
        ];
        let pasts = (0..layers)
            .map(|_| ctx.allocator.create_tensor(&shape, element.dtype()))
            .collect::<Result<Vec<_>>>()?;
        shape[3] = ctx.params.sequence_length;
        let presents = (0..layers)
            .map(|_| ctx.allocator.create_tensor(&shape, element.dtype()))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            layers,
            ?shape,
            element = ?element,
            copy = copy.name(),
            "combined kv cache allocated"
        );

        Ok(Self {
            allocator: ctx.allocator.clone(),
            copy,
            element,
            beam_width: ctx.params.search.num_beams,
            shape,
            input_names,
            output_names,
            pasts,
            presents,
            slots: None,
        })
    }

    pub fn element(&self) -> KvElement {
        self.element
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn pasts(&self) -> &[KvTensor<R>] {
        &self.pasts
    }

    pub fn presents(&self) -> &[KvTensor<R>] {
        &self.presents
    }

    fn reordered_past(&self, present: &KvTensor<R>, beam_indices: &[i32]) -> Result<KvTensor<R>> {
        let layout = BeamLayout::combined(present.shape())?;
        gather_beams(self.copy.as_ref(), present, beam_indices, layout)
    }
}

impl<R: KvRuntime> KeyValueCache<R> for CombinedKvCache<R> {
    fn bind(&mut self, request: &mut dyn ExecutionRequest<R>) -> Result<()> {
        let slots = BoundSlots::at(request);
        for (name, past) in self.input_names.iter().zip(&self.pasts) {
            request.push_input(name, past.clone());
        }
        for (name, present) in self.output_names.iter().zip(&self.presents) {
            request.push_output(name, present.clone());
        }
        self.slots = Some(slots);
        Ok(())
    }

    fn advance(
        &mut self,
        request: &mut dyn ExecutionRequest<R>,
        beam_indices: &[i32],
        current_length: usize,
    ) -> Result<()> {
        let slots = require_bound(self.slots, CACHE_NAME)?;
        let layers = self.layer_count();
        slots.check(request, layers, layers)?;
        check_beam_request(beam_indices, self.beam_width, self.shape[1])?;

        let pasts = if beam_indices.is_empty() {
            self.presents.clone()
        } else {
            self.presents
                .iter()
                .map(|present| self.reordered_past(present, beam_indices))
                .collect::<Result<Vec<_>>>()?
        };
        let mut shape = self.shape;
        shape[3] = current_length;
        let presents = (0..layers)
            .map(|_| self.allocator.create_tensor(&shape, self.element.dtype()))
            .collect::<Result<Vec<_>>>()?;

        for (i, (past, present)) in pasts.iter().zip(&presents).enumerate() {
            request.set_input(slots.input + i, past.clone())?;
            request.set_output(slots.output + i, present.clone())?;
        }
        self.shape = shape;
        self.pasts = pasts;
        self.presents = presents;
        Ok(())
    }

    fn layer_count(&self) -> usize {
        self.input_names.len()
    }
}
