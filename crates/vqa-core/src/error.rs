use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("safetensors error: {0}")]
    SafeTensor(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported dtype {0}")]
    UnsupportedDtype(String),

    #[error("tensor `{0}` missing")]
    MissingTensor(String),

    #[error("batch field `{field}` has shape {got:?}, expected {expected}")]
    Shape {
        field: &'static str,
        expected: String,
        got: Vec<i64>,
    },
}

pub type Result<T> = std::result::Result<T, ModelError>;
