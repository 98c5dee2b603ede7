pub mod readback;

pub use readback::WgpuReadback;
