//! Shared helpers for kvrt backend parity tests.

use kvrt::inference::config::{DecoderConfig, GeneratorParams, ModelConfig};
#[cfg(any(feature = "cuda", feature = "wgpu"))]
use std::sync::{Mutex, OnceLock};

#[cfg(feature = "cuda")]
static CUDA_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
#[cfg(feature = "wgpu")]
static WGPU_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Decoder config with default slot names.
pub fn decoder_model(layers: usize, heads: usize, head_size: usize) -> ModelConfig {
    ModelConfig {
        model_type: "llama".into(),
        context_length: 64,
        decoder: DecoderConfig {
            num_hidden_layers: layers,
            num_key_value_heads: heads,
            head_size,
            inputs: Default::default(),
            outputs: Default::default(),
            cross_attention_length: 1500,
            sliding_window: None,
        },
    }
}

pub fn beam_params(batch: usize, beams: usize, sequence_length: usize) -> GeneratorParams {
    let mut params = GeneratorParams::new(batch, sequence_length);
    params.search.num_beams = beams;
    params
}

/// Deterministic f32 pattern.
pub fn det_f32(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.1).sin() * 0.5).collect()
}

#[cfg(feature = "cuda")]
pub fn with_cuda_backend<F>(mut f: F)
where
    F: FnMut(kvrt::tensor::CudaAllocator),
{
    let _guard = CUDA_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !numr::runtime::cuda::is_cuda_available() {
        eprintln!("CUDA feature enabled but no device found, skipping");
        return;
    }
    // the driver panics when its library cannot be loaded
    let allocator = match std::panic::catch_unwind(|| kvrt::tensor::CudaAllocator::cuda(0)) {
        Ok(a) => a,
        Err(_) => {
            eprintln!("CUDA feature enabled but runtime unavailable, skipping");
            return;
        }
    };
    f(allocator);
}

#[cfg(feature = "wgpu")]
pub fn with_wgpu_backend<F>(mut f: F)
where
    F: FnMut(wgpu::Device, wgpu::Queue),
{
    let _guard = WGPU_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let instance = wgpu::Instance::default();
    let adapter =
        match pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
        {
            Ok(a) => a,
            Err(e) => {
                eprintln!("No wgpu adapter: {:?}, skipping", e);
                return;
            }
        };
    let (device, queue) =
        match pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default())) {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("Failed to create wgpu device: {:?}, skipping", e);
                return;
            }
        };
    f(device, queue);
}
