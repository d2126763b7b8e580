pub mod attention;
pub mod batch;
pub mod config;
pub mod encoder;
pub mod error;
pub mod layer_norm;
pub mod model;
pub mod safetensors_util;

pub use batch::{Batch, VqaInputs};
pub use config::{ModelConfig, ModelKind};
pub use error::{ModelError, Result};
pub use model::{build_model, SingleStreamVqa, TwoStreamVqa, VqaModel};
