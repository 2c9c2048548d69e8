//! Shared input matrices for the burn workload.
//!
//! A and B are generated once per run and handed to every worker behind an
//! `Arc`. They are never mutated after creation.

use crate::config::Precision;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed for the input matrices. Fixed so every run burns the same data.
pub const INPUT_SEED: u64 = 10;

/// Element storage for the two input matrices.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixData {
    Single { a: Vec<f32>, b: Vec<f32> },
    Double { a: Vec<f64>, b: Vec<f64> },
}

/// The A and B operands, row-major, `size * size` elements each.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMatrices {
    size: usize,
    data: MatrixData,
}

impl InputMatrices {
    /// Generates both operands for a square matrix of side `size`.
    ///
    /// Values are drawn as doubles in `[0, 10)` with five decimal digits and
    /// narrowed for single precision, so both variants come from the same
    /// random stream.
    pub fn generate(size: usize, precision: Precision) -> Self {
        let elements = size * size;
        let mut rng = StdRng::seed_from_u64(INPUT_SEED);
        let mut a = Vec::with_capacity(elements);
        let mut b = Vec::with_capacity(elements);
        for _ in 0..elements {
            a.push(rng.gen_range(0..1_000_000u32) as f64 / 100_000.0);
            b.push(rng.gen_range(0..1_000_000u32) as f64 / 100_000.0);
        }

        let data = match precision {
            Precision::Double => MatrixData::Double { a, b },
            Precision::Single => MatrixData::Single {
                a: a.into_iter().map(|v| v as f32).collect(),
                b: b.into_iter().map(|v| v as f32).collect(),
            },
        };

        Self { size, data }
    }

    /// Side length of the square matrices.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn precision(&self) -> Precision {
        match self.data {
            MatrixData::Single { .. } => Precision::Single,
            MatrixData::Double { .. } => Precision::Double,
        }
    }

    pub fn data(&self) -> &MatrixData {
        &self.data
    }

    /// Bytes taken by one `size * size` matrix at this precision.
    pub fn matrix_bytes(&self) -> u64 {
        (self.size * self.size * self.precision().element_size()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let first = InputMatrices::generate(16, Precision::Double);
        let second = InputMatrices::generate(16, Precision::Double);
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_is_narrowed_double() {
        let single = InputMatrices::generate(8, Precision::Single);
        let double = InputMatrices::generate(8, Precision::Double);

        let (MatrixData::Single { a: sa, b: sb }, MatrixData::Double { a: da, b: db }) =
            (single.data(), double.data())
        else {
            panic!("unexpected matrix variants");
        };
        for (s, d) in sa.iter().zip(da).chain(sb.iter().zip(db)) {
            assert_eq!(*s, *d as f32);
        }
    }

    #[test]
    fn test_value_range() {
        let inputs = InputMatrices::generate(32, Precision::Double);
        let MatrixData::Double { a, b } = inputs.data() else {
            panic!("expected double data");
        };
        assert_eq!(a.len(), 32 * 32);
        assert_eq!(b.len(), 32 * 32);
        assert!(a.iter().chain(b).all(|v| (0.0..10.0).contains(v)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_matrix_bytes() {
        assert_eq!(
            InputMatrices::generate(4, Precision::Single).matrix_bytes(),
            64
        );
        assert_eq!(
            InputMatrices::generate(4, Precision::Double).matrix_bytes(),
            128
        );
    }
}
