pub mod copy;
pub mod readback;

pub use copy::CopyOps;
pub use readback::{ReadbackDevice, ReadbackRegion};
