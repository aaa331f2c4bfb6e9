pub mod pipeline;
pub mod predict;

pub use pipeline::run_training;
pub use predict::{default_model_path, default_output_path, run_prediction};
