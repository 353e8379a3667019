use serde::{Deserialize, Serialize};

use super::scalar::{QuantBits, QuantizationParams, QuantizedVector};
use crate::error::{CardsightError, Result};

/// Row-major matrix of quantized vectors sharing one parameter set.
///
/// Row `i` always describes the `i`-th entry of whatever array the matrix was
/// built alongside (catalog metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedMatrix {
    params: QuantizationParams,
    dimension: usize,
    rows: usize,
    codes: QuantizedVector,
}

impl QuantizedMatrix {
    /// Fits global parameters on `values` and encodes every row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `dimension == 0`, `DimensionMismatch` if the
    /// length of `values` is not a multiple of `dimension`, and propagates
    /// `DegenerateInput` from the fit.
    pub fn quantize(values: &[f32], dimension: usize, bits: QuantBits) -> Result<Self> {
        if dimension == 0 {
            return Err(CardsightError::InvalidConfig(
                "dimension must be > 0".into(),
            ));
        }
        if values.len() % dimension != 0 {
            return Err(CardsightError::DimensionMismatch {
                expected: dimension,
                actual: values.len() % dimension,
            });
        }

        let params = QuantizationParams::fit(values, bits)?;
        let codes = params.encode(values);

        Ok(Self {
            params,
            dimension,
            rows: values.len() / dimension,
            codes,
        })
    }

    /// The shared quantization parameters.
    #[must_use]
    pub fn params(&self) -> &QuantizationParams {
        &self.params
    }

    /// Elements per row.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns `true` if the matrix holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// All codes, row-major.
    #[must_use]
    pub fn codes(&self) -> &QuantizedVector {
        &self.codes
    }

    /// Decodes the whole matrix, row-major.
    #[must_use]
    pub fn decode_all(&self) -> Vec<f32> {
        self.params.decode(&self.codes)
    }

    /// Decodes a single row.
    #[must_use]
    pub fn decode_row(&self, row: usize) -> Option<Vec<f32>> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.dimension;
        let end = start + self.dimension;
        let decoded = match &self.codes {
            QuantizedVector::U8(c) => c[start..end]
                .iter()
                .map(|&v| self.params.dequantize_value(u32::from(v)))
                .collect(),
            QuantizedVector::U16(c) => c[start..end]
                .iter()
                .map(|&v| self.params.dequantize_value(u32::from(v)))
                .collect(),
        };
        Some(decoded)
    }

    /// Storage of the codes in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.codes.nbytes()
    }

    /// Storage the same matrix would need as `f32`.
    #[must_use]
    pub fn float_nbytes(&self) -> usize {
        self.rows * self.dimension * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_keeps_shape() {
        let values = vec![0.1, 0.2, -0.3, 0.4, 0.5, -0.6];
        let m = QuantizedMatrix::quantize(&values, 3, QuantBits::Eight).unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.dimension(), 3);
        assert_eq!(m.nbytes(), 6);
        assert_eq!(m.float_nbytes(), 24);
        assert_eq!(m.decode_all().len(), 6);
    }

    #[test]
    fn decode_row_matches_decode_all() {
        let values = vec![0.1, 0.2, -0.3, 0.4, 0.5, -0.6];
        let m = QuantizedMatrix::quantize(&values, 3, QuantBits::Sixteen).unwrap();
        let all = m.decode_all();
        assert_eq!(m.decode_row(1).unwrap(), all[3..6].to_vec());
        assert!(m.decode_row(2).is_none());
    }

    #[test]
    fn ragged_input_is_rejected() {
        let err = QuantizedMatrix::quantize(&[0.1, 0.2, 0.3], 2, QuantBits::Eight).unwrap_err();
        assert!(matches!(err, CardsightError::DimensionMismatch { .. }));
    }
}
