pub mod config;
pub mod kv_cache;
pub mod names;
pub mod readback;
pub mod session;

pub use config::{
    DecoderConfig, DecoderInputNames, DecoderOutputNames, GeneratorParams, ModelConfig,
    SearchConfig, SlidingWindowConfig,
};
pub use kv_cache::{
    CombinedKvCache, CrossCache, KeyValueCache, KvElement, SlidingWindowKvCache, SplitKvCache,
    create_kv_cache,
};
pub use names::{MAX_KV_NAME_LENGTH, compose_kv_name};
pub use readback::{DEFAULT_INITIAL_CAPACITY, ReadbackHeap, compute_new_capacity};
pub use session::{CacheContext, ExecutionRequest, ModelInfo, NamedSlot, SessionInfo, SlotList};
