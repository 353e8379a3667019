//! # Scalar Quantization
//!
//! Fixed-point encoding of float vectors with a single scale and zero point
//! shared by the whole corpus. Statistics are global over every element of the
//! embedding matrix, not per dimension: skewed distributions lose precision in
//! exchange for one parameter pair per catalog.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CardsightError, Result};

/// Width of a quantized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QuantBits {
    /// One byte per element.
    #[default]
    Eight,
    /// Two bytes per element.
    Sixteen,
}

impl QuantBits {
    /// Number of bits per element.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    /// Number of representable levels, `2^bits`.
    #[must_use]
    pub const fn levels(self) -> u32 {
        1 << self.bits()
    }

    /// Bytes used to store one element.
    #[must_use]
    pub const fn bytes_per_element(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Fraction of memory saved relative to `f32` storage.
    #[must_use]
    pub fn memory_reduction(self) -> f64 {
        1.0 - f64::from(self.bits()) / 32.0
    }
}

impl TryFrom<u8> for QuantBits {
    type Error = CardsightError;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            other => Err(CardsightError::InvalidConfig(format!(
                "quantization bits must be 8 or 16, got {other}"
            ))),
        }
    }
}

impl From<QuantBits> for u8 {
    fn from(bits: QuantBits) -> Self {
        bits.bits() as u8
    }
}

impl fmt::Display for QuantBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "int{}", self.bits())
    }
}

/// Scale and zero point fitted on a whole embedding matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    /// Code width.
    pub bits: QuantBits,
    /// Step between two adjacent levels. Always `> 0`.
    pub scale: f32,
    /// Code that represents `0.0`.
    pub zero_point: i32,
    /// Smallest value seen at fit time.
    pub min: f32,
    /// Largest value seen at fit time.
    pub max: f32,
}

impl QuantizationParams {
    /// Fits parameters on every element of `values`.
    ///
    /// `values` is typically a row-major `[N][D]` matrix; its shape does not
    /// matter because the statistics are global.
    ///
    /// # Errors
    ///
    /// Returns `DegenerateInput` if `values` is empty, contains a non-finite
    /// number, or is constant (`max == min`, scale undefined).
    pub fn fit(values: &[f32], bits: QuantBits) -> Result<Self> {
        if values.is_empty() {
            return Err(CardsightError::DegenerateInput("no values to fit".into()));
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in values {
            if !v.is_finite() {
                return Err(CardsightError::DegenerateInput(format!(
                    "non-finite value {v}"
                )));
            }
            min = min.min(v);
            max = max.max(v);
        }

        if max == min {
            return Err(CardsightError::DegenerateInput(format!(
                "constant input (min == max == {min})"
            )));
        }

        let scale = ((f64::from(max) - f64::from(min)) / f64::from(bits.levels() - 1)) as f32;
        let zero_point = (-f64::from(min) / f64::from(scale)).round_ties_even() as i32;

        Ok(Self {
            bits,
            scale,
            zero_point,
            min,
            max,
        })
    }

    /// Highest representable code.
    #[must_use]
    pub const fn max_code(&self) -> u32 {
        self.bits.levels() - 1
    }

    /// Quantizes one value: `clip(round(x / scale + zero_point), 0, levels - 1)`.
    #[must_use]
    #[inline]
    pub fn quantize_value(&self, x: f32) -> u32 {
        let level = f64::from(x) / f64::from(self.scale) + f64::from(self.zero_point);
        level.round_ties_even().clamp(0.0, f64::from(self.max_code())) as u32
    }

    /// Reconstructs one value: `(code - zero_point) * scale`.
    #[must_use]
    #[inline]
    pub fn dequantize_value(&self, code: u32) -> f32 {
        ((f64::from(code) - f64::from(self.zero_point)) * f64::from(self.scale)) as f32
    }

    /// Encodes a vector into codes of the configured width.
    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> QuantizedVector {
        match self.bits {
            QuantBits::Eight => QuantizedVector::U8(
                vector
                    .iter()
                    .map(|&x| self.quantize_value(x) as u8)
                    .collect(),
            ),
            QuantBits::Sixteen => QuantizedVector::U16(
                vector
                    .iter()
                    .map(|&x| self.quantize_value(x) as u16)
                    .collect(),
            ),
        }
    }

    /// Decodes codes back to floats.
    #[must_use]
    pub fn decode(&self, codes: &QuantizedVector) -> Vec<f32> {
        let mut out = Vec::with_capacity(codes.len());
        self.decode_into(codes, &mut out);
        out
    }

    /// Decodes codes, appending the floats to `out`.
    pub fn decode_into(&self, codes: &QuantizedVector, out: &mut Vec<f32>) {
        match codes {
            QuantizedVector::U8(c) => {
                out.extend(c.iter().map(|&v| self.dequantize_value(u32::from(v))));
            }
            QuantizedVector::U16(c) => {
                out.extend(c.iter().map(|&v| self.dequantize_value(u32::from(v))));
            }
        }
    }

    /// Worst-case reconstruction error for values inside `[min, max]`.
    #[must_use]
    pub fn error_bound(&self) -> f32 {
        self.scale / 2.0
    }
}

/// Codes of one vector (or a row-major matrix of vectors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizedVector {
    /// 8-bit codes.
    U8(Vec<u8>),
    /// 16-bit codes.
    U16(Vec<u16>),
}

impl QuantizedVector {
    /// Number of codes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(c) => c.len(),
            Self::U16(c) => c.len(),
        }
    }

    /// Returns `true` if there are no codes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage size of the codes in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        match self {
            Self::U8(c) => c.len(),
            Self::U16(c) => c.len() * 2,
        }
    }

    /// Code at `i` widened to `u32`.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<u32> {
        match self {
            Self::U8(c) => c.get(i).map(|&v| u32::from(v)),
            Self::U16(c) => c.get(i).map(|&v| u32::from(v)),
        }
    }
}
