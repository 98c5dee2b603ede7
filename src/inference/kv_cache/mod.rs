//! Attention KV caches
//!
//! Four cache layouts share one lifecycle: construct once per generation,
//! [`bind`](KeyValueCache::bind) into the first request, then
//! [`advance`](KeyValueCache::advance) after every graph run.
//!
//! - [`CombinedKvCache`]: one `[2, B, H, S, D]` tensor per layer
//! - [`SplitKvCache`]: separate key and value tensors, optionally a shared
//!   fixed buffer
//! - [`CrossCache`]: encoder outputs for cross-attention, written once
//! - [`SlidingWindowKvCache`]: fixed-capacity `u8` window

pub mod beam;
pub mod combined;
pub mod cross;
pub mod element;
pub mod sliding_window;
pub mod split;

pub use beam::{BeamLayout, gather_beams, validate_beam_indices};
pub use combined::CombinedKvCache;
pub use cross::CrossCache;
pub use element::KvElement;
pub use sliding_window::{SlideLayout, SlidingWindowKvCache, WindowLayer, WindowShapes};
pub use split::SplitKvCache;

use super::names::compose_kv_name;
use super::session::{CacheContext, ExecutionRequest};
use crate::error::{Error, Result};
use crate::tensor::KvRuntime;
use numr::runtime::Runtime;

/// Self-attention cache driven by the decode loop
pub trait KeyValueCache<R: Runtime>: Send {
    /// Register the cache's tensors on `request` and remember their slots.
    fn bind(&mut self, request: &mut dyn ExecutionRequest<R>) -> Result<()>;

    /// Absorb the presents written by the last run and prepare the next one.
    ///
    /// `beam_indices[j]` names the old row that new row `j` continues; empty
    /// means rows carry forward unchanged. `current_length` is the sequence
    /// length of the next run's presents.
    fn advance(
        &mut self,
        request: &mut dyn ExecutionRequest<R>,
        beam_indices: &[i32],
        current_length: usize,
    ) -> Result<()>;

    fn layer_count(&self) -> usize;
}

/// Pick the self-attention cache the session's graph expects.
///
/// Returns `None` when the graph declares no past inputs.
pub fn create_kv_cache<R: KvRuntime>(
    ctx: &CacheContext<'_, R>,
) -> Result<Option<Box<dyn KeyValueCache<R>>>> {
    let decoder = &ctx.model.decoder;
    if decoder.sliding_window.is_some() {
        return Ok(Some(Box::new(SlidingWindowKvCache::new(ctx)?)));
    }
    let combined_name = compose_kv_name(&decoder.inputs.past_names, 0)?;
    if ctx.session.has_input(&combined_name) {
        return Ok(Some(Box::new(CombinedKvCache::new(ctx)?)));
    }
    if SplitKvCache::<R>::is_cache_needed(ctx.model, ctx.session) {
        return Ok(Some(Box::new(SplitKvCache::new(ctx)?)));
    }
    Ok(None)
}

/// Slot indices recorded by `bind`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoundSlots {
    pub input: usize,
    pub output: usize,
}

impl BoundSlots {
    pub(crate) fn at<R: Runtime>(request: &dyn ExecutionRequest<R>) -> Self {
        Self {
            input: request.input_count(),
            output: request.output_count(),
        }
    }

    /// Fail unless `request` still has `inputs` and `outputs` slots from here.
    pub(crate) fn check<R: Runtime>(
        &self,
        request: &dyn ExecutionRequest<R>,
        inputs: usize,
        outputs: usize,
    ) -> Result<()> {
        if self.input + inputs > request.input_count()
            || self.output + outputs > request.output_count()
        {
            return Err(Error::InferenceError {
                reason: format!(
                    "request has {} inputs and {} outputs, cache is bound at {:?} with {} and {}",
                    request.input_count(),
                    request.output_count(),
                    self,
                    inputs,
                    outputs
                ),
            });
        }
        Ok(())
    }
}

pub(crate) fn require_bound(slots: Option<BoundSlots>, cache: &str) -> Result<BoundSlots> {
    slots.ok_or_else(|| Error::InferenceError {
        reason: format!("{cache}: advance called before bind"),
    })
}

/// Beam indices a combined or split cache may act on.
pub(crate) fn check_beam_request(beam_indices: &[i32], beam_width: usize, rows: usize) -> Result<()> {
    if beam_indices.is_empty() {
        if beam_width > 1 {
            return Err(Error::InvalidArgument {
                arg: "beam_indices",
                reason: format!("beam width {beam_width} requires beam indices"),
            });
        }
        return Ok(());
    }
    validate_beam_indices(beam_indices, rows)
}
