//! Sliding-window KV cache
//!
//! A fixed-capacity `u8` cache for models exported with a static context.
//! Each layer holds an "in" tensor (the history fed to the graph) and an
//! "out" tensor (the window of positions the graph just produced), for key
//! and for value:
//!
//! ```text
//! key_in    [H, 1, D, C - W]      key_out    [H, 1, D, W]
//! value_in  [H, 1, C - W, D]      value_out  [H, 1, W, D]
//! ```
//!
//! The first run consumes the prompt W positions at a time. After it the
//! window collapses to one position and every later step slides the history
//! left by one, appending the newest position at the tail. Both moves are a
//! `narrow` of the history joined to the window with `cat`, then copied into
//! the destination so slot addresses stay put.

use super::beam::validate_beam_indices;
use super::{BoundSlots, KeyValueCache, require_bound};
use crate::error::{Error, Result};
use crate::inference::names::compose_layer_names;
use crate::inference::session::{CacheContext, ExecutionRequest};
use crate::ops::{CopyOps, select_copy_ops};
use crate::tensor::{KvRuntime, KvTensor, TensorAllocator};
use numr::dtype::DType;
use numr::ops::ShapeOps;
use numr::tensor::Tensor;
use rayon::prelude::*;
use std::sync::Arc;

const CACHE_NAME: &str = "sliding window kv cache";

/// Where the position axis sits in a 4-d cache tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlideLayout {
    /// Position axis, counted from the end
    pub slide_axis: isize,
}

impl SlideLayout {
    pub const KEY: Self = Self { slide_axis: -1 };
    pub const VALUE: Self = Self { slide_axis: -2 };

    /// `[heads, 1, ·, ·]` with `positions` on the slide axis and `head_size`
    /// on the other.
    pub fn shape(self, heads: usize, head_size: usize, positions: usize) -> [usize; 4] {
        let mut shape = [heads, 1, head_size, head_size];
        shape[(4 + self.slide_axis) as usize] = positions;
        shape
    }

    /// Extent of the slide axis in `shape`.
    pub fn positions(self, shape: &[usize]) -> Result<usize> {
        let axis = shape.len() as isize + self.slide_axis;
        if axis < 0 {
            return Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!("shape {:?} has no axis {}", shape, self.slide_axis),
            });
        }
        Ok(shape[axis as usize])
    }

    /// `history` without its first `drop` positions, followed by `tail`.
    fn shifted<R: KvRuntime>(
        self,
        client: &R::Client,
        history: &Tensor<R>,
        drop: usize,
        tail: &Tensor<R>,
    ) -> Result<Tensor<R>> {
        let positions = self.positions(history.shape())?;
        if drop > positions {
            return Err(Error::InvalidArgument {
                arg: "window",
                reason: format!("window {} wider than history {}", drop, positions),
            });
        }
        if drop == positions {
            return Ok(tail.clone());
        }
        let kept = history.narrow(self.slide_axis, drop, positions - drop)?;
        Ok(client.cat(&[&kept, tail], self.slide_axis)?)
    }
}

/// Shapes of one layer's four tensors at a given window size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShapes {
    pub key_in: [usize; 4],
    pub key_out: [usize; 4],
    pub value_in: [usize; 4],
    pub value_out: [usize; 4],
}

impl WindowShapes {
    fn new(heads: usize, head_size: usize, context_length: usize, window: usize) -> Self {
        let history = context_length - window;
        Self {
            key_in: SlideLayout::KEY.shape(heads, head_size, history),
            key_out: SlideLayout::KEY.shape(heads, head_size, window),
            value_in: SlideLayout::VALUE.shape(heads, head_size, history),
            value_out: SlideLayout::VALUE.shape(heads, head_size, window),
        }
    }
}

/// The four tensors of one layer
pub struct WindowLayer<R: KvRuntime> {
    key_in: KvTensor<R>,
    key_out: KvTensor<R>,
    value_in: KvTensor<R>,
    value_out: KvTensor<R>,
}

impl<R: KvRuntime> WindowLayer<R> {
    fn allocate(allocator: &dyn TensorAllocator<R>, shapes: &WindowShapes) -> Result<Self> {
        Ok(Self {
            key_in: allocator.create_tensor(&shapes.key_in, DType::U8)?,
            key_out: allocator.create_tensor(&shapes.key_out, DType::U8)?,
            value_in: allocator.create_tensor(&shapes.value_in, DType::U8)?,
            value_out: allocator.create_tensor(&shapes.value_out, DType::U8)?,
        })
    }

    pub fn key_in(&self) -> &KvTensor<R> {
        &self.key_in
    }

    pub fn key_out(&self) -> &KvTensor<R> {
        &self.key_out
    }

    pub fn value_in(&self) -> &KvTensor<R> {
        &self.value_in
    }

    pub fn value_out(&self) -> &KvTensor<R> {
        &self.value_out
    }

    fn pairs(&self) -> [(&KvTensor<R>, &KvTensor<R>, SlideLayout); 2] {
        [
            (&self.key_in, &self.key_out, SlideLayout::KEY),
            (&self.value_in, &self.value_out, SlideLayout::VALUE),
        ]
    }

    /// Shift each history left by one window and append the window, in place.
    fn slide(&self, client: &R::Client) -> Result<()> {
        for (input, output, layout) in self.pairs() {
            let window = layout.positions(output.shape())?;
            let shifted = layout.shifted(client, input.tensor(), window, output.tensor())?;
            input.assign(&shifted)?;
        }
        Ok(())
    }

    /// Fresh layer at `shapes` whose histories are `old_in[1..] ++ old_out`.
    fn collapse(
        &self,
        client: &R::Client,
        allocator: &dyn TensorAllocator<R>,
        shapes: &WindowShapes,
    ) -> Result<Self> {
        let collapsed = Self::allocate(allocator, shapes)?;
        for ((input, output, layout), new_in) in
            self.pairs().into_iter().zip([&collapsed.key_in, &collapsed.value_in])
        {
            let joined = layout.shifted(client, input.tensor(), 1, output.tensor())?;
            new_in.assign(&joined)?;
        }
        Ok(collapsed)
    }
}

pub struct SlidingWindowKvCache<R: KvRuntime> {
    allocator: Arc<dyn TensorAllocator<R>>,
    client: R::Client,
    copy: Arc<dyn CopyOps<R>>,
    heads: usize,
    head_size: usize,
    context_length: usize,
    window_size: usize,
    input_names: Vec<String>,
    output_names: Vec<String>,
    layers: Vec<WindowLayer<R>>,
    slots: Option<BoundSlots>,
}

impl<R: KvRuntime> SlidingWindowKvCache<R> {
    pub fn new(ctx: &CacheContext<'_, R>) -> Result<Self> {
        ctx.validate()?;
        let decoder = &ctx.model.decoder;
        let window = decoder.sliding_window.ok_or_else(|| Error::InvalidConfig {
            reason: format!("{CACHE_NAME} needs decoder.sliding_window"),
        })?;

        let rows = ctx.params.batch_beam_size();
        if rows != 1 {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "{CACHE_NAME} supports exactly one sequence, got batch × beam = {rows}"
                ),
            });
        }
        let space = ctx.allocator.memory_space();
        if !space.is_host_addressable() {
            return Err(Error::InvalidConfig {
                reason: format!("{CACHE_NAME} needs host-addressable memory, allocator is {space:?}"),
            });
        }

        let layers = decoder.num_hidden_layers;
        let mut input_names = Vec::with_capacity(2 * layers);
        let mut output_names = Vec::with_capacity(2 * layers);
        let past_keys = compose_layer_names(&decoder.inputs.past_key_names, layers)?;
        let past_values = compose_layer_names(&decoder.inputs.past_value_names, layers)?;
        let present_keys = compose_layer_names(&decoder.outputs.present_key_names, layers)?;
        let present_values = compose_layer_names(&decoder.outputs.present_value_names, layers)?;
        for i in 0..layers {
            input_names.extend([past_keys[i].clone(), past_values[i].clone()]);
            output_names.extend([present_keys[i].clone(), present_values[i].clone()]);
        }

        let dtype = ctx.session.input_dtype(&input_names[0])?;
        if dtype != DType::U8 {
            return Err(Error::UnsupportedDType {
                cache: CACHE_NAME,
                dtype,
            });
        }

        let shapes = WindowShapes::new(
            decoder.num_key_value_heads,
            decoder.head_size,
            ctx.model.context_length,
            window.window_size,
        );
        let copy = select_copy_ops(ctx.allocator.as_ref());
        let window_layers = (0..layers)
            .map(|_| {
                let layer = WindowLayer::allocate(ctx.allocator.as_ref(), &shapes)?;
                copy.fill(&layer.key_in, window.pad_value)?;
                copy.fill(&layer.value_in, window.pad_value)?;
                Ok(layer)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            layers,
            window_size = window.window_size,
            pad_value = window.pad_value,
            ?shapes,
            "sliding window kv cache allocated"
        );

        Ok(Self {
            allocator: ctx.allocator.clone(),
            client: ctx.allocator.client().clone(),
            copy,
            heads: decoder.num_key_value_heads,
            head_size: decoder.head_size,
            context_length: ctx.model.context_length,
            window_size: window.window_size,
            input_names,
            output_names,
            layers: window_layers,
            slots: None,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Shapes of every layer's tensors at the current window size.
    pub fn shapes(&self) -> WindowShapes {
        WindowShapes::new(self.heads, self.head_size, self.context_length, self.window_size)
    }

    pub fn layers(&self) -> &[WindowLayer<R>] {
        &self.layers
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl<R: KvRuntime> KeyValueCache<R> for SlidingWindowKvCache<R> {
    fn bind(&mut self, request: &mut dyn ExecutionRequest<R>) -> Result<()> {
        let slots = BoundSlots::at(request);
        for (i, layer) in self.layers.iter().enumerate() {
            request.push_input(&self.input_names[2 * i], layer.key_in.clone());
            request.push_input(&self.input_names[2 * i + 1], layer.value_in.clone());
            request.push_output(&self.output_names[2 * i], layer.key_out.clone());
            request.push_output(&self.output_names[2 * i + 1], layer.value_out.clone());
        }
        self.slots = Some(slots);
        Ok(())
    }

    fn advance(
        &mut self,
        request: &mut dyn ExecutionRequest<R>,
        beam_indices: &[i32],
        _current_length: usize,
    ) -> Result<()> {
        let slots = require_bound(self.slots, CACHE_NAME)?;
        let count = 2 * self.layers.len();
        slots.check(request, count, count)?;
        if !beam_indices.is_empty() {
            validate_beam_indices(beam_indices, 1)?;
        }

        let client = &self.client;
        if self.window_size == 1 {
            self.layers.par_iter().try_for_each(|layer| layer.slide(client))?;
            return self.copy.synchronize();
        }

        let shapes = WindowShapes::new(self.heads, self.head_size, self.context_length, 1);
        let allocator = self.allocator.as_ref();
        let collapsed = self
            .layers
            .par_iter()
            .map(|layer| layer.collapse(client, allocator, &shapes))
            .collect::<Result<Vec<_>>>()?;
        self.copy.synchronize()?;

        for (i, layer) in collapsed.iter().enumerate() {
            request.set_input(slots.input + 2 * i, layer.key_in.clone())?;
            request.set_input(slots.input + 2 * i + 1, layer.value_in.clone())?;
            request.set_output(slots.output + 2 * i, layer.key_out.clone())?;
            request.set_output(slots.output + 2 * i + 1, layer.value_out.clone())?;
        }
        tracing::debug!(
            from = self.window_size,
            key_in = ?shapes.key_in,
            "sliding window collapsed"
        );
        self.layers = collapsed;
        self.window_size = 1;
        Ok(())
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }
}
