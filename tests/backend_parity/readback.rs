//! Readback parity: host queue emulation vs wgpu staging.

use kvrt::inference::readback::ReadbackHeap;
use kvrt::ops::{CpuReadbackQueue, ReadbackRegion};
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

fn regions() -> Vec<Vec<u8>> {
    vec![
        (0..8u8).collect(),
        (100..112u8).collect(),
        (200..204u8).collect(),
    ]
}

fn host_reference() -> Vec<Vec<u8>> {
    let device = CpuDevice::new();
    let sources: Vec<_> = regions()
        .iter()
        .map(|r| Tensor::<CpuRuntime>::from_slice(r, &[r.len()], &device))
        .collect();
    let srcs: Vec<_> = sources
        .iter()
        .map(|s| ReadbackRegion::new(s, 0, s.numel()))
        .collect();
    let mut out: Vec<Vec<u8>> = regions().iter().map(|r| vec![0; r.len()]).collect();
    let mut dsts: Vec<&mut [u8]> = out.iter_mut().map(|v| v.as_mut_slice()).collect();
    let mut heap = ReadbackHeap::with_initial_capacity(CpuReadbackQueue::new(), 4).unwrap();
    heap.read_back_many(&mut dsts, &srcs).unwrap();
    out
}

#[test]
fn test_host_readback_reference() {
    assert_eq!(host_reference(), regions());
}

#[cfg(feature = "wgpu")]
#[test]
fn test_wgpu_readback_parity() {
    use super::helpers::with_wgpu_backend;
    use kvrt::ops::WgpuReadback;
    use wgpu::util::DeviceExt;

    let expected = host_reference();
    with_wgpu_backend(|device, queue| {
        let buffers: Vec<wgpu::Buffer> = regions()
            .iter()
            .map(|r| {
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("readback_src"),
                    contents: r,
                    usage: wgpu::BufferUsages::COPY_SRC,
                })
            })
            .collect();
        let srcs: Vec<_> = buffers
            .iter()
            .zip(regions())
            .map(|(b, r)| ReadbackRegion::new(b, 0, r.len()))
            .collect();

        let mut out: Vec<Vec<u8>> = regions().iter().map(|r| vec![0; r.len()]).collect();
        let mut dsts: Vec<&mut [u8]> = out.iter_mut().map(|v| v.as_mut_slice()).collect();
        let mut heap = ReadbackHeap::with_initial_capacity(WgpuReadback::new(device, queue), 4)
            .unwrap();
        heap.read_back_many(&mut dsts, &srcs).unwrap();
        assert_eq!(out, expected, "read_back_many wgpu vs CPU");
    });
}
