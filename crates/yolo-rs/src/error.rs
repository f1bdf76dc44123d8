use thiserror::Error;

/// Errors raised while configuring the decoder or reading detector output.
#[derive(Error, Debug)]
pub enum Error {
    #[error("threshold `{name}` must lie in [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "output for scale `{scale}` has shape {actual:?}, expected {expected:?} \
         ({anchors} anchors x (5 + {classes} classes), grid rows x cols)"
    )]
    ShapeMismatch {
        scale: String,
        expected: [usize; 3],
        actual: Vec<usize>,
        anchors: usize,
        classes: usize,
    },
    #[error("unknown scale `{0}`")]
    UnknownScale(String),
    #[error("no output supplied for scale `{0}`")]
    MissingScale(String),
    #[error("bad tensor: {0}")]
    Tensor(#[from] ndarray::ShapeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
