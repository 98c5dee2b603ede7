//! Beam reorder parity: host copy vs asynchronous device copy.

use super::helpers::*;
use kvrt::inference::kv_cache::{BeamLayout, gather_beams};
use kvrt::ops::select_copy_ops;
use kvrt::tensor::HostAllocator;
use numr::runtime::cpu::CpuRuntime;

fn host_gather(data: &[f32], shape: &[usize], indices: &[i32]) -> Vec<f32> {
    let alloc = HostAllocator::new();
    let src = alloc.tensor_from_slice(data, shape).unwrap();
    let copy = select_copy_ops::<CpuRuntime>(&alloc);
    let layout = BeamLayout::combined(shape).unwrap();
    gather_beams(copy.as_ref(), &src, indices, layout)
        .unwrap()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn test_gather_beams_host_reference() {
    // Keep the layout helpers exercised on builds without device features.
    let model = decoder_model(1, 2, 4);
    let params = beam_params(1, 3, 5);
    assert_eq!(params.batch_beam_size(), 3);

    let shape = [2, 3, model.decoder.num_key_value_heads, 5, model.decoder.head_size];
    let n: usize = shape.iter().product();
    let s = det_f32(n);
    let d = host_gather(&s, &shape, &[2, 0, 0]);

    let row = n / (2 * 3);
    let half = 3 * row;
    for h in 0..2 {
        assert_eq!(&d[h * half..h * half + row], &s[h * half + 2 * row..h * half + 3 * row]);
        assert_eq!(&d[h * half + row..h * half + 2 * row], &s[h * half..h * half + row]);
        assert_eq!(&d[h * half + 2 * row..(h + 1) * half], &s[h * half..h * half + row]);
    }
}

#[cfg(feature = "cuda")]
#[test]
fn test_gather_beams_cuda_parity() {
    use kvrt::tensor::TensorAllocator;

    let shape = [2, 4, 2, 3, 8];
    let n: usize = shape.iter().product();
    let data = det_f32(n);
    let indices = [3, 3, 1, 0];
    let expected = host_gather(&data, &shape, &indices);

    with_cuda_backend(|cuda| {
        let copy = cuda.copy_ops();
        assert!(copy.is_async());
        let src = cuda.tensor_from_slice(&data, &shape).unwrap();
        let layout = BeamLayout::combined(&shape).unwrap();
        let dst = gather_beams(copy.as_ref(), &src, &indices, layout).unwrap();
        copy.synchronize().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), expected, "gather_beams CUDA vs CPU");
    });
}
