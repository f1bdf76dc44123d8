pub mod codec;
pub mod dataset;
pub mod decoder;
pub mod error;
pub mod eval;
pub mod filter;
pub mod geometry;
pub mod nms;
pub mod params;
pub mod types;

pub use codec::{AnchorGrid, DecodedGrid, Target};
pub use dataset::Dataset;
pub use decoder::Decoder;
pub use error::{Error, Result};
pub use eval::{ClassAp, EvalSummary, Evaluator, PrRecord};
pub use geometry::{iou, CenterBox, CornerBox};
pub use params::{AnchorPrior, DetectorConfig, ImageSize, ScaleConfig, Thresholds};
pub use types::{Detection, GroundTruth};
