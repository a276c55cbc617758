//! Cross-checking two backends on the same window.

use ndarray::{Array4, ArrayView4};
use tracing::info;

use crate::backend::InferenceBackend;
use crate::error::DenoiseError;

/// Maximum absolute element difference between two equally shaped arrays.
pub fn max_abs_diff(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Run `reference` and `candidate` on `window` and return their max
/// absolute difference, or [`DenoiseError::NumericalMismatch`] when it
/// exceeds `tolerance`.
pub fn compare_backends(
    reference: &dyn InferenceBackend,
    candidate: &dyn InferenceBackend,
    window: ArrayView4<'_, f32>,
    tolerance: f32,
) -> Result<f32, DenoiseError> {
    let expected = reference
        .infer(window)
        .map_err(|e| e.into_tile_error(0, 0))?;
    let actual = candidate
        .infer(window)
        .map_err(|e| e.into_tile_error(0, 0))?;

    if expected.shape() != actual.shape() {
        return Err(DenoiseError::InvalidTileOutput {
            row: 0,
            col: 0,
            expected: shape4(&expected),
            actual: actual.shape().to_vec(),
        });
    }

    let diff = max_abs_diff(expected.view(), actual.view());
    info!(
        reference = reference.name(),
        candidate = candidate.name(),
        max_abs_diff = diff,
        tolerance,
        "Compared backend outputs"
    );
    // NaN compares false, so it never passes as a match.
    if diff <= tolerance && !expected.iter().chain(actual.iter()).any(|v| v.is_nan()) {
        Ok(diff)
    } else {
        Err(DenoiseError::NumericalMismatch {
            max_abs_diff: diff,
            tolerance,
        })
    }
}

/// Deterministic `(1, 1, size, size)` window in `[0, 1)` for smoke checks.
pub fn synthetic_window(size: usize, seed: u64) -> Array4<f32> {
    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
    Array4::from_shape_simple_fn((1, 1, size, size), || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 40) as f32 / (1u64 << 24) as f32
    })
}

fn shape4(a: &Array4<f32>) -> [usize; 4] {
    let (n, c, h, w) = a.dim();
    [n, c, h, w]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;

    struct Scaled(f32);

    impl InferenceBackend for Scaled {
        fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
            Ok(window.mapv(|v| v * self.0))
        }

        fn name(&self) -> &str {
            "scaled"
        }
    }

    #[test]
    fn matching_backends_report_difference() {
        let window = synthetic_window(16, 1);
        let diff = compare_backends(&Scaled(1.0), &Scaled(1.0), window.view(), 1e-3).expect("match");
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn diverging_backends_are_a_mismatch() {
        let window = synthetic_window(16, 2);
        let err = compare_backends(&Scaled(1.0), &Scaled(2.0), window.view(), 1e-3).unwrap_err();
        match err {
            DenoiseError::NumericalMismatch { max_abs_diff, tolerance } => {
                assert!(max_abs_diff > 1e-3);
                assert_eq!(tolerance, 1e-3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn nan_output_never_matches() {
        let window = synthetic_window(4, 3);
        let err = compare_backends(&Scaled(f32::NAN), &Scaled(f32::NAN), window.view(), 1.0);
        assert!(matches!(err, Err(DenoiseError::NumericalMismatch { .. })));
    }

    #[test]
    fn synthetic_window_is_deterministic_and_bounded() {
        let a = synthetic_window(8, 5);
        assert_eq!(a, synthetic_window(8, 5));
        assert_ne!(a, synthetic_window(8, 6));
        assert!(a.iter().all(|&v| (0.0..1.0).contains(&v)));
    }
}
