pub mod copy;

pub use copy::DeviceCopy;
