use kvrt::inference::config::{
    DecoderConfig, GeneratorParams, ModelConfig, SlidingWindowConfig,
};
use kvrt::inference::kv_cache::{
    CombinedKvCache, CrossCache, KeyValueCache, SlidingWindowKvCache, SplitKvCache,
    create_kv_cache,
};
use kvrt::inference::session::{CacheContext, ExecutionRequest, SessionInfo, SlotList};
use kvrt::tensor::{HostAllocator, KvTensor, TensorAllocator};
use kvrt::{DType, Error};
use numr::runtime::cpu::CpuRuntime;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn model(layers: usize, heads: usize, head_size: usize) -> ModelConfig {
    ModelConfig {
        model_type: "llama".into(),
        context_length: 32,
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

fn sliding_model(layers: usize, context_length: usize, window_size: usize) -> ModelConfig {
    let mut model = model(layers, 2, 3);
    model.context_length = context_length;
    model.decoder.sliding_window = Some(SlidingWindowConfig {
        window_size,
        pad_value: 0xAA,
    });
    model
}

fn params(batch: usize, beams: usize, sequence_length: usize) -> GeneratorParams {
    let mut params = GeneratorParams::new(batch, sequence_length);
    params.search.num_beams = beams;
    params
}

type Requests = SlotList<CpuRuntime>;

fn host() -> Arc<dyn TensorAllocator<CpuRuntime>> {
    Arc::new(HostAllocator::new())
}

fn write_f32(tensor: &KvTensor<CpuRuntime>, data: &[f32]) {
    tensor.write_bytes(bytemuck::cast_slice(data)).unwrap();
}

fn write_bytes(tensor: &KvTensor<CpuRuntime>, data: &[u8]) {
    tensor.write_bytes(data).unwrap();
}

fn assert_unique_names(request: &Requests) {
    let inputs: HashSet<_> = request.inputs().iter().map(|s| &s.name).collect();
    let outputs: HashSet<_> = request.outputs().iter().map(|s| &s.name).collect();
    assert_eq!(inputs.len(), request.input_count());
    assert_eq!(outputs.len(), request.output_count());
}

// ── slot counts ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn test_slot_counts_per_variant(layers in 1usize..6) {
        let params = params(1, 1, 4);

        let m = model(layers, 1, 2);
        let session = SessionInfo::new().with_input("past_0", DType::F32);
        let ctx = CacheContext::new(&m, &params, &session, host());
        let mut request = Requests::new();
        CombinedKvCache::new(&ctx).unwrap().bind(&mut request).unwrap();
        prop_assert_eq!(request.input_count(), layers);
        prop_assert_eq!(request.output_count(), layers);
        assert_unique_names(&request);

        let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F16);
        let ctx = CacheContext::new(&m, &params, &session, host());
        let mut request = Requests::new();
        SplitKvCache::new(&ctx).unwrap().bind(&mut request).unwrap();
        prop_assert_eq!(request.input_count(), 2 * layers);
        prop_assert_eq!(request.output_count(), 2 * layers);
        assert_unique_names(&request);

        let session = SessionInfo::new().with_input("past_key_cross_0", DType::F16);
        let ctx = CacheContext::new(&m, &params, &session, host());
        let cross = CrossCache::new(&ctx).unwrap();
        let mut request = Requests::new();
        cross.add_inputs(&mut request);
        cross.add_outputs(&mut request);
        prop_assert_eq!(request.input_count(), 2 * layers);
        prop_assert_eq!(request.output_count(), 2 * layers);
        assert_unique_names(&request);

        let m = sliding_model(layers, 8, 2);
        let session = SessionInfo::new().with_input("past_key_values.0.key", DType::U8);
        let ctx = CacheContext::new(&m, &params, &session, host());
        let mut request = Requests::new();
        SlidingWindowKvCache::new(&ctx).unwrap().bind(&mut request).unwrap();
        prop_assert_eq!(request.input_count(), 2 * layers);
        prop_assert_eq!(request.output_count(), 2 * layers);
        assert_unique_names(&request);
    }
}

// ── beam reorder ───────────────────────────────────────────────────────

/// Bytes of every past bound after one advance with `indices`, starting from
/// presents filled with distinct values.
fn pasts_after_advance(past_name: &str, batch: usize, indices: &[i32]) -> Vec<Vec<u8>> {
    let m = model(2, 2, 3);
    let p = params(batch, 1, 4);
    let session = SessionInfo::new().with_input(past_name, DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = create_kv_cache(&ctx).unwrap().unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    for (i, present) in request.outputs().iter().enumerate() {
        let data: Vec<f32> = (0..present.tensor.numel()).map(|j| (i * 1000 + j) as f32).collect();
        write_f32(&present.tensor, &data);
    }
    cache.advance(&mut request, indices, 5).unwrap();
    request
        .inputs()
        .iter()
        .map(|slot| slot.tensor.to_vec::<u8>().unwrap())
        .collect()
}

#[test]
fn test_identity_indices_match_carry_forward() {
    for past_name in ["past_0", "past_key_values.0.key"] {
        let carried = pasts_after_advance(past_name, 1, &[]);
        assert!(carried.iter().all(|bytes| bytes.iter().any(|b| *b != 0)));
        assert_eq!(carried, pasts_after_advance(past_name, 1, &[0]), "{past_name}");
    }
}

#[test]
fn test_identity_indices_match_carry_forward_batch_of_two() {
    for past_name in ["past_0", "past_key_values.0.key"] {
        assert_eq!(
            pasts_after_advance(past_name, 2, &[]),
            pasts_after_advance(past_name, 2, &[0, 1]),
            "{past_name}"
        );
    }
}

#[test]
fn test_reversed_batch_is_not_identity() {
    for past_name in ["past_0", "past_key_values.0.key"] {
        assert_ne!(
            pasts_after_advance(past_name, 2, &[]),
            pasts_after_advance(past_name, 2, &[1, 0]),
            "{past_name}"
        );
    }
}

#[test]
fn test_swap_two_beams_combined() {
    let m = model(1, 2, 2);
    let p = params(1, 2, 3);
    let session = SessionInfo::new().with_input("past_0", DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = CombinedKvCache::new(&ctx).unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();

    // [2, 2, 2, 3, 2]: each beam row is 12 elements
    let present = cache.presents()[0].clone();
    let data: Vec<f32> = (0..present.numel()).map(|i| i as f32).collect();
    write_f32(&present, &data);

    cache.advance(&mut request, &[1, 0], 4).unwrap();
    let past = cache.pasts()[0].to_vec::<f32>().unwrap();
    let row = 12;
    for half in 0..2 {
        let base = half * 2 * row;
        assert_eq!(&past[base..base + row], &data[base + row..base + 2 * row]);
        assert_eq!(&past[base + row..base + 2 * row], &data[base..base + row]);
    }
    assert_ne!(cache.pasts()[0].id(), present.id());
    assert_eq!(request.input("past_0").unwrap().id(), cache.pasts()[0].id());
    assert_eq!(request.output("present_0").unwrap().shape(), &[2, 2, 2, 4, 2]);
}

#[test]
fn test_swap_two_beams_split_key_and_value_independently() {
    let m = model(1, 1, 2);
    let p = params(1, 2, 2);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = SplitKvCache::new(&ctx).unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();

    // [2, 1, 2, 2] per tensor: rows of 4 elements
    write_f32(&cache.presents()[0], &[1., 2., 3., 4., 5., 6., 7., 8.]);
    write_f32(&cache.presents()[1], &[-1., -2., -3., -4., -5., -6., -7., -8.]);
    cache.advance(&mut request, &[1, 0], 3).unwrap();

    assert_eq!(
        cache.pasts()[0].to_vec::<f32>().unwrap(),
        vec![5., 6., 7., 8., 1., 2., 3., 4.]
    );
    assert_eq!(
        cache.pasts()[1].to_vec::<f32>().unwrap(),
        vec![-5., -6., -7., -8., -1., -2., -3., -4.]
    );
}

#[test]
fn test_out_of_range_beam_index_keeps_state() {
    let m = model(1, 1, 2);
    let p = params(1, 2, 2);
    let session = SessionInfo::new().with_input("past_0", DType::F16);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = CombinedKvCache::new(&ctx).unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    let present = cache.presents()[0].id();

    let r = cache.advance(&mut request, &[0, 2], 3);
    assert!(matches!(r, Err(Error::BeamIndex { position: 1, index: 2, rows: 2 })));
    assert_eq!(cache.presents()[0].id(), present);
    assert_eq!(request.output("present_0").unwrap().id(), present);
}

proptest! {
    #[test]
    fn test_gather_follows_beam_indices(
        indices in (1usize..5).prop_flat_map(|rows| {
            proptest::collection::vec(0..rows as i32, rows)
        }),
    ) {
        let rows = indices.len();
        let m = model(1, 1, 2);
        let p = params(1, rows, 2);
        let session = SessionInfo::new().with_input("past_0", DType::F32);
        let ctx = CacheContext::new(&m, &p, &session, host());
        let mut cache = CombinedKvCache::new(&ctx).unwrap();
        let mut request = Requests::new();
        cache.bind(&mut request).unwrap();

        let present = cache.presents()[0].clone();
        let data: Vec<f32> = (0..present.numel()).map(|i| i as f32).collect();
        write_f32(&present, &data);
        cache.advance(&mut request, &indices, 3).unwrap();

        let past = cache.pasts()[0].to_vec::<f32>().unwrap();
        let row = 4;
        for half in 0..2 {
            let base = half * rows * row;
            for (j, &index) in indices.iter().enumerate() {
                let src = base + index as usize * row;
                prop_assert_eq!(&past[base + j * row..base + (j + 1) * row], &data[src..src + row]);
            }
        }
    }
}

// ── shared buffer ──────────────────────────────────────────────────────

#[test]
fn test_shared_buffer_identity_is_stable() {
    let m = model(2, 1, 2);
    let mut p = params(1, 1, 3);
    p.search.past_present_share_buffer = true;
    p.search.max_length = Some(10);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = SplitKvCache::new(&ctx).unwrap();
    assert!(cache.is_share_buffer());

    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    let ids = |r: &Requests| {
        r.inputs()
            .iter()
            .chain(r.outputs())
            .map(|s| s.tensor.id())
            .collect::<Vec<_>>()
    };
    let before = ids(&request);
    for (input, output) in request.inputs().iter().zip(request.outputs()) {
        assert_eq!(input.tensor.id(), output.tensor.id());
        assert_eq!(input.tensor.shape(), &[1, 1, 10, 2]);
    }
    for step in 4..8 {
        cache.advance(&mut request, &[], step).unwrap();
        assert_eq!(ids(&request), before);
    }
}

// ── sliding window ─────────────────────────────────────────────────────

fn sliding_cache(
    context_length: usize,
    window_size: usize,
) -> (SlidingWindowKvCache<CpuRuntime>, Requests) {
    let m = sliding_model(1, context_length, window_size);
    let p = params(1, 1, window_size);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::U8);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = SlidingWindowKvCache::new(&ctx).unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    (cache, request)
}

#[test]
fn test_sliding_in_tensors_padded() {
    let (cache, _) = sliding_cache(8, 3);
    let layer = &cache.layers()[0];
    assert_eq!(layer.key_in().shape(), &[2, 1, 3, 5]);
    assert_eq!(layer.value_in().shape(), &[2, 1, 5, 3]);
    assert!(layer.key_in().to_vec::<u8>().unwrap().iter().all(|b| *b == 0xAA));
    assert!(layer.value_in().to_vec::<u8>().unwrap().iter().all(|b| *b == 0xAA));
}

#[test]
fn test_sliding_collapse_then_slide() {
    let (c, w) = (8usize, 3usize);
    let (mut cache, mut request) = sliding_cache(c, w);

    // key_in [2,1,3,5]: 6 rows of 5; key_out [2,1,3,3]: 6 rows of 3
    let layer = &cache.layers()[0];
    let key_in: Vec<u8> = (0..30).collect();
    let key_out: Vec<u8> = (100..118).collect();
    write_bytes(layer.key_in(), &key_in);
    write_bytes(layer.key_out(), &key_out);
    // value_in [2,1,5,3]: 2 rows of 15; value_out [2,1,3,3]: 2 rows of 9
    let value_in: Vec<u8> = (0..30).collect();
    let value_out: Vec<u8> = (200..218).collect();
    write_bytes(layer.value_in(), &value_in);
    write_bytes(layer.value_out(), &value_out);

    cache.advance(&mut request, &[], 0).unwrap();
    assert_eq!(cache.window_size(), 1);
    let layer = &cache.layers()[0];
    assert_eq!(layer.key_in().shape(), &[2, 1, 3, c - 1]);
    assert_eq!(layer.key_out().shape(), &[2, 1, 3, 1]);
    assert_eq!(layer.value_in().shape(), &[2, 1, c - 1, 3]);
    assert_eq!(layer.value_out().shape(), &[2, 1, 1, 3]);
    assert_eq!(request.input("past_key_values.0.key").unwrap().id(), layer.key_in().id());
    assert_eq!(request.output("present.0.value").unwrap().id(), layer.value_out().id());

    let collapsed_key = layer.key_in().to_vec::<u8>().unwrap();
    for r in 0..6 {
        let row = &collapsed_key[r * 7..(r + 1) * 7];
        assert_eq!(&row[..4], &key_in[r * 5 + 1..(r + 1) * 5]);
        assert_eq!(&row[4..], &key_out[r * 3..(r + 1) * 3]);
    }
    let collapsed_value = layer.value_in().to_vec::<u8>().unwrap();
    for r in 0..2 {
        let row = &collapsed_value[r * 21..(r + 1) * 21];
        assert_eq!(&row[..12], &value_in[r * 15 + 3..(r + 1) * 15]);
        assert_eq!(&row[12..], &value_out[r * 9..(r + 1) * 9]);
    }

    // Slide: shapes stay, bytes shift by one position
    let ids: Vec<_> = request.inputs().iter().map(|s| s.tensor.id()).collect();
    let key_before = layer.key_in().to_vec::<u8>().unwrap();
    write_bytes(layer.key_out(), &[1, 2, 3, 4, 5, 6]);
    let value_before = layer.value_in().to_vec::<u8>().unwrap();
    write_bytes(layer.value_out(), &[7, 8, 9, 10, 11, 12]);
    cache.advance(&mut request, &[0], 0).unwrap();

    let layer = &cache.layers()[0];
    assert_eq!(layer.key_in().shape(), &[2, 1, 3, c - 1]);
    assert_eq!(request.inputs().iter().map(|s| s.tensor.id()).collect::<Vec<_>>(), ids);
    let key_after = layer.key_in().to_vec::<u8>().unwrap();
    for r in 0..6 {
        assert_eq!(&key_after[r * 7..r * 7 + 6], &key_before[r * 7 + 1..(r + 1) * 7]);
        assert_eq!(key_after[r * 7 + 6], r as u8 + 1);
    }
    let value_after = layer.value_in().to_vec::<u8>().unwrap();
    for r in 0..2 {
        let base = r * 21;
        assert_eq!(&value_after[base..base + 18], &value_before[base + 3..base + 21]);
        let tail = 7 + 3 * r as u8;
        assert_eq!(&value_after[base + 18..base + 21], &[tail, tail + 1, tail + 2]);
    }
}

#[test]
fn test_sliding_rejects_beams_and_dtype() {
    let m = sliding_model(1, 8, 2);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::U8);
    let p = params(1, 2, 2);
    let ctx = CacheContext::new(&m, &p, &session, host());
    assert!(matches!(
        SlidingWindowKvCache::new(&ctx),
        Err(Error::InvalidConfig { .. })
    ));

    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F16);
    let p = params(1, 1, 2);
    let ctx = CacheContext::new(&m, &p, &session, host());
    assert!(matches!(
        SlidingWindowKvCache::new(&ctx),
        Err(Error::UnsupportedDType { .. })
    ));
}

#[test]
fn test_sliding_rejects_nonzero_beam_index() {
    let (mut cache, mut request) = sliding_cache(8, 2);
    assert!(cache.advance(&mut request, &[1], 0).is_err());
    assert_eq!(cache.window_size(), 2);
}

// ── factory ────────────────────────────────────────────────────────────

#[test]
fn test_create_kv_cache_selection() {
    let p = params(1, 1, 2);

    let m = model(3, 1, 2);
    let session = SessionInfo::new().with_input("past_0", DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = create_kv_cache(&ctx).unwrap().unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    assert_eq!(cache.layer_count(), 3);
    assert_eq!(request.input_count(), 3);

    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F32);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = create_kv_cache(&ctx).unwrap().unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    assert_eq!(request.input_count(), 6);

    let session = SessionInfo::new().with_input("input_ids", DType::I64);
    let ctx = CacheContext::new(&m, &p, &session, host());
    assert!(create_kv_cache(&ctx).unwrap().is_none());

    let m = sliding_model(2, 8, 2);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::U8);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = create_kv_cache(&ctx).unwrap().unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    assert_eq!(request.output_count(), 4);
}

#[test]
fn test_decode_loop_sequence_growth() {
    let m = model(1, 1, 2);
    let p = params(2, 1, 3);
    let session = SessionInfo::new().with_input("past_key_values.0.key", DType::F16);
    let ctx = CacheContext::new(&m, &p, &session, host());
    let mut cache = create_kv_cache(&ctx).unwrap().unwrap();
    let mut request = Requests::new();
    cache.bind(&mut request).unwrap();
    assert_eq!(request.inputs()[0].tensor.shape(), &[2, 1, 0, 2]);

    for length in 4..7 {
        cache.advance(&mut request, &[], length).unwrap();
        assert_eq!(request.outputs()[0].tensor.shape(), &[2, 1, length, 2]);
        assert_eq!(request.inputs()[1].tensor.shape(), &[2, 1, length - 1, 2]);
    }
}
