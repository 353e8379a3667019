pub mod matrix;
pub mod scalar;

pub use matrix::QuantizedMatrix;
pub use scalar::{QuantBits, QuantizationParams, QuantizedVector};
