pub mod helpers;

pub mod beam_reorder;
pub mod readback;
