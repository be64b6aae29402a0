pub mod classifier;
pub mod frame_walker;
