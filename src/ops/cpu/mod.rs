pub mod copy;
pub mod readback;

pub use copy::HostCopy;
pub use readback::{CpuReadbackQueue, CpuReadbackStats, CpuStaging};
