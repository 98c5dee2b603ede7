//! Split key/value cache
//!
//! Key and value get their own `[batch × beam, kv_heads, sequence, head_size]`
//! tensor per layer, so slots come in interleaved pairs:
//! `key_0, value_0, key_1, value_1, ...`.
//!
//! With `past_present_share_buffer` the cache allocates every tensor once at
//! `max_length` and binds the same tensor as input and output. The graph
//! writes the new positions in place and `advance` has nothing to do.

use super::beam::{BeamLayout, gather_beams};
use super::{BoundSlots, KeyValueCache, KvElement, check_beam_request, require_bound};
use crate::error::{Error, Result};
use crate::inference::config::ModelConfig;
use crate::inference::names::{compose_kv_name, compose_layer_names};
use crate::inference::session::{CacheContext, ExecutionRequest, ModelInfo};
use crate::ops::{CopyOps, select_copy_ops};
use crate::tensor::{KvRuntime, KvTensor, StaticBacking, TensorAllocator};
use std::sync::Arc;

const CACHE_NAME: &str = "split kv cache";

pub struct SplitKvCache<R: KvRuntime> {
    allocator: Arc<dyn TensorAllocator<R>>,
    copy: Arc<dyn CopyOps<R>>,
    element: KvElement,
    beam_width: usize,
    share_buffer: bool,
    shape: [usize; 4],
    input_names: Vec<String>,
    output_names: Vec<String>,
    pasts: Vec<KvTensor<R>>,
    presents: Vec<KvTensor<R>>,
    slots: Option<BoundSlots>,
}

impl<R: KvRuntime> SplitKvCache<R> {
    /// Whether the session's graph takes a split past at all.
    pub fn is_cache_needed(model: &ModelConfig, session: &dyn ModelInfo) -> bool {
        compose_kv_name(&model.decoder.inputs.past_key_names, 0)
            .is_ok_and(|name| session.has_input(&name))
    }

    pub fn new(ctx: &CacheContext<'_, R>) -> Result<Self> {
        Self::build(ctx, None)
    }

    /// Shared-buffer cache whose presents sit on caller-provided backings,
    /// one per slot in key/value order.
    ///
    /// Used when the decoder graph was captured and its buffer addresses
    /// must never move.
    pub fn with_static_backings(
        ctx: &CacheContext<'_, R>,
        backings: &[StaticBacking<R>],
    ) -> Result<Self> {
        Self::build(ctx, Some(backings))
    }

    fn build(ctx: &CacheContext<'_, R>, backings: Option<&[StaticBacking<R>]>) -> Result<Self> {
        ctx.validate()?;
        let decoder = &ctx.model.decoder;
        let layers = decoder.num_hidden_layers;
        let beam_width = ctx.params.search.num_beams;

        let requested = ctx.params.search.past_present_share_buffer;
        let share_buffer = requested && (beam_width == 1 || ctx.model.is_whisper());
        if requested && !share_buffer {
            tracing::warn!(
                beam_width,
                model_type = %ctx.model.model_type,
                "past_present_share_buffer is only supported with a single beam or whisper; disabling it"
            );
        }

        if let Some(backings) = backings {
            if !share_buffer {
                return Err(Error::InvalidConfig {
                    reason: "static kv backings require past_present_share_buffer".into(),
                });
            }
            if backings.len() != 2 * layers {
                return Err(Error::InvalidConfig {
                    reason: format!(
                        "{} static kv backings for {} key/value slots",
                        backings.len(),
                        2 * layers
                    ),
                });
            }
        }

        let input_names = interleave(
            compose_layer_names(&decoder.inputs.past_key_names, layers)?,
            compose_layer_names(&decoder.inputs.past_value_names, layers)?,
        );
        let output_names = interleave(
            compose_layer_names(&decoder.outputs.present_key_names, layers)?,
            compose_layer_names(&decoder.outputs.present_value_names, layers)?,
        );
        let element = KvElement::from_dtype(ctx.session.input_dtype(&input_names[0])?, CACHE_NAME)?;
        let dtype = element.dtype();
        let copy = select_copy_ops(ctx.allocator.as_ref());

        let mut shape = [
            ctx.params.batch_beam_size(),
            decoder.num_key_value_heads,
            0,
            decoder.head_size,
        ];
        shape[2] = if share_buffer {
            ctx.params.max_length(ctx.model)
        } else {
            ctx.params.sequence_length
        };

        let presents = (0..2 * layers)
            .map(|i| {
                let present = match backings {
                    Some(backings) => {
                        ctx.allocator
                            .create_tensor_on_static_backing(&shape, dtype, &backings[i])?
                    }
                    None => ctx.allocator.create_tensor(&shape, dtype)?,
                };
                copy.fill(&present, 0)?;
                Ok(present)
            })
            .collect::<Result<Vec<_>>>()?;

        let pasts = if share_buffer {
            presents.clone()
        } else {
            let empty = [shape[0], shape[1], 0, shape[3]];
            (0..2 * layers)
                .map(|_| ctx.allocator.create_tensor(&empty, dtype))
                .collect::<Result<Vec<_>>>()?
        };

        tracing::debug!(
            layers,
            ?shape,
            element = ?element,
            share_buffer,
            static_backed = backings.is_some(),
            copy = copy.name(),
            "split kv cache allocated"
        );

        Ok(Self {
            allocator: ctx.allocator.clone(),
            copy,
            element,
            beam_width,
            share_buffer,
            shape,
            input_names,
            output_names,
            pasts,
            presents,
            slots: None,
        })
    }

    pub fn is_share_buffer(&self) -> bool {
        self.share_buffer
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

    /// Register the presents as outputs of an encoder pass.
    ///
    /// The encoder runs once, so no slot indices are kept.
    pub fn add_encoder(&self, request: &mut dyn ExecutionRequest<R>) {
        for (name, present) in self.output_names.iter().zip(&self.presents) {
            request.push_output(name, present.clone());
        }
    }

    fn reordered_past(&self, present: &KvTensor<R>, beam_indices: &[i32]) -> Result<KvTensor<R>> {
        let layout = BeamLayout::split(present.shape())?;
        gather_beams(self.copy.as_ref(), present, beam_indices, layout)
    }
}

fn interleave(keys: Vec<String>, values: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .zip(values)
        .flat_map(|(k, v)| [k, v])
        .collect()
}

impl<R: KvRuntime> KeyValueCache<R> for SplitKvCache<R> {
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
        if self.share_buffer {
            return Ok(());
        }
        let count = self.presents.len();
        slots.check(request, count, count)?;
        check_beam_request(beam_indices, self.beam_width, self.shape[0])?;

        let pasts = if beam_indices.is_empty() {
            self.presents.clone()
        } else {
            self.presents
                .iter()
                .map(|present| self.reordered_past(present, beam_indices))
                .collect::<Result<Vec<_>>>()?
        };
        let mut shape = self.shape;
        shape[2] = current_length;
        let presents = (0..count)
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
        self.presents.len() / 2
    }
}
