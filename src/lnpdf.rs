//! Log-probability densities aligned to a batch of candidates.
//!
//! A value of negative infinity marks a candidate with exactly zero
//! probability. Combination and normalization keep that marker intact.

use std::ops::Index;

use crate::error::{InversionError, Result};
use crate::math::logsumexp;

/// Natural-log probability densities, one per candidate column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LnPdf {
    values: Vec<f64>,
}

impl LnPdf {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// A density of `len` candidates that all have probability one.
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0f64; len],
        }
    }

    /// A density of `len` candidates that are all impossible.
    pub fn impossible(len: usize) -> Self {
        Self {
            values: vec![f64::NEG_INFINITY; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    /// Elementwise sum in log space.
    ///
    /// This is the joint density under the assumption that both inputs are
    /// independent. Negative infinity on either side wins over anything else,
    /// including positive infinity and NaN. Fails if the lengths differ.
    pub fn combine(&self, other: &LnPdf) -> Result<LnPdf> {
        if self.len() != other.len() {
            return Err(InversionError::SizeMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
                    f64::NEG_INFINITY
                } else {
                    a + b
                }
            })
            .collect();
        Ok(LnPdf { values })
    }

    /// Largest finite value, if any.
    pub fn max_finite(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .reduce(f64::max)
    }

    /// Convert to probabilities that sum to one.
    ///
    /// The maximum finite value is subtracted before exponentiating. Entries
    /// that are not finite never contribute to the sum and come out as exactly
    /// zero. If no entry is finite there is nothing to normalize and
    /// [`InversionError::NoProbabilityMass`] is returned.
    pub fn normalize(&self) -> Result<Vec<f64>> {
        let max = self.max_finite().ok_or(InversionError::NoProbabilityMass)?;
        let mut probabilities: Vec<f64> = self
            .values
            .iter()
            .map(|&v| if v.is_finite() { (v - max).exp() } else { 0f64 })
            .collect();
        let total: f64 = probabilities.iter().sum();
        probabilities.iter_mut().for_each(|p| *p /= total);
        Ok(probabilities)
    }

    /// Log of the total probability mass.
    pub fn logsumexp(&self) -> f64 {
        logsumexp(&self.values)
    }

    /// Replace NaN and positive infinity by negative infinity.
    ///
    /// Returns the cleaned density and the number of values that were clipped.
    pub fn sanitize(mut self) -> (LnPdf, usize) {
        let mut clipped = 0;
        for value in self.values.iter_mut() {
            if value.is_nan() || *value == f64::INFINITY {
                *value = f64::NEG_INFINITY;
                clipped += 1;
            }
        }
        (self, clipped)
    }

    /// Number of candidates with non-zero probability.
    pub fn count_possible(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    /// Concatenate densities of consecutive sub-batches.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a LnPdf>) -> LnPdf {
        let values = parts
            .into_iter()
            .flat_map(|part| part.values.iter().copied())
            .collect();
        LnPdf { values }
    }
}

/// Combine any number of equal length densities.
///
/// Returns `None` if `parts` is empty.
pub fn combine_all<'a>(parts: impl IntoIterator<Item = &'a LnPdf>) -> Result<Option<LnPdf>> {
    let mut parts = parts.into_iter();
    let Some(first) = parts.next() else {
        return Ok(None);
    };
    parts
        .try_fold(first.clone(), |acc, next| acc.combine(next))
        .map(Some)
}

impl From<Vec<f64>> for LnPdf {
    fn from(values: Vec<f64>) -> Self {
        LnPdf::new(values)
    }
}

impl FromIterator<f64> for LnPdf {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        LnPdf::new(iter.into_iter().collect())
    }
}

impl Index<usize> for LnPdf {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const NEG_INF: f64 = f64::NEG_INFINITY;

    fn ln_values(len: usize) -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(
            prop_oneof![4 => -50f64..10f64, 1 => Just(NEG_INF)],
            len,
        )
    }

    fn triple() -> impl Strategy<Value = (Vec<f64>, Vec<f64>, Vec<f64>)> {
        (1usize..30).prop_flat_map(|n| (ln_values(n), ln_values(n), ln_values(n)))
    }

    /// Values a misbehaving forward model may return.
    fn raw_values(len: usize) -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(
            prop_oneof![
                4 => -50f64..10f64,
                1 => Just(NEG_INF),
                1 => Just(f64::INFINITY),
                1 => Just(f64::NAN),
            ],
            len,
        )
    }

    fn ln_and_raw() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
        (1usize..30).prop_flat_map(|n| (ln_values(n), raw_values(n)))
    }

    proptest! {
        #[test]
        fn combine_is_elementwise_sum((a, b) in ln_and_raw()) {
            let joint = LnPdf::new(a.clone()).combine(&LnPdf::new(b.clone())).unwrap();
            let flipped = LnPdf::new(b.clone()).combine(&LnPdf::new(a.clone())).unwrap();
            for i in 0..a.len() {
                if a[i] == NEG_INF || b[i] == NEG_INF {
                    prop_assert_eq!(joint[i], NEG_INF);
                    prop_assert_eq!(flipped[i], NEG_INF);
                } else if b[i].is_nan() {
                    prop_assert!(joint[i].is_nan());
                } else {
                    prop_assert_eq!(joint[i], a[i] + b[i]);
                }
            }
        }

        #[test]
        fn combine_is_commutative((a, b, _) in triple()) {
            let a = LnPdf::new(a);
            let b = LnPdf::new(b);
            prop_assert_eq!(a.combine(&b).unwrap(), b.combine(&a).unwrap());
        }

        #[test]
        fn combine_is_associative((a, b, c) in triple()) {
            let a = LnPdf::new(a);
            let b = LnPdf::new(b);
            let c = LnPdf::new(c);
            let left = a.combine(&b).unwrap().combine(&c).unwrap();
            let right = a.combine(&b.combine(&c).unwrap()).unwrap();
            for (l, r) in left.iter().zip(right.iter()) {
                if l == NEG_INF {
                    prop_assert_eq!(r, NEG_INF);
                } else {
                    prop_assert!((l - r).abs() <= 1e-12 * l.abs().max(1.));
                }
            }
        }

        #[test]
        fn normalize_sums_to_one(values in ln_values(20)) {
            let pdf = LnPdf::new(values.clone());
            match pdf.normalize() {
                Ok(p) => {
                    prop_assert!((p.iter().sum::<f64>() - 1.).abs() < 1e-10);
                    for (i, &v) in values.iter().enumerate() {
                        if v == NEG_INF {
                            prop_assert_eq!(p[i], 0.);
                        }
                    }
                }
                Err(InversionError::NoProbabilityMass) => {
                    prop_assert!(values.iter().all(|&v| v == NEG_INF));
                }
                Err(err) => prop_assert!(false, "unexpected error {}", err),
            }
        }

        #[test]
        fn normalize_ignores_shift(values in ln_values(15), shift in -100f64..100f64) {
            prop_assume!(values.iter().any(|v| v.is_finite()));
            let plain = LnPdf::new(values.clone()).normalize().unwrap();
            let shifted = LnPdf::new(values.iter().map(|v| v + shift).collect())
                .normalize()
                .unwrap();
            for (p, q) in plain.iter().zip(shifted.iter()) {
                prop_assert!((p - q).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn combine_size_mismatch() {
        let err = LnPdf::zeros(3).combine(&LnPdf::zeros(4)).unwrap_err();
        assert!(matches!(
            err,
            InversionError::SizeMismatch { left: 3, right: 4 }
        ));
    }

    #[test]
    fn impossible_absorbs_infinite_values() {
        let a = LnPdf::new(vec![NEG_INF, 0., NEG_INF]);
        let b = LnPdf::new(vec![f64::INFINITY, 0., f64::NAN]);
        assert_eq!(a.combine(&b).unwrap().values(), &[NEG_INF, 0., NEG_INF]);
        assert_eq!(b.combine(&a).unwrap().values(), &[NEG_INF, 0., NEG_INF]);
    }

    #[test]
    fn normalize_all_impossible() {
        let err = LnPdf::impossible(5).normalize().unwrap_err();
        assert!(matches!(err, InversionError::NoProbabilityMass));
    }

    #[test]
    fn normalize_large_values() {
        let pdf = LnPdf::new(vec![1000., 1000., NEG_INF, 1000. + 2f64.ln()]);
        let p = pdf.normalize().unwrap();
        assert_relative_eq!(p[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(p[3], 0.5, epsilon = 1e-12);
        assert_eq!(p[2], 0.);
    }

    #[test]
    fn sanitize_clips_non_finite() {
        let (pdf, clipped) = LnPdf::new(vec![0., f64::NAN, f64::INFINITY, NEG_INF]).sanitize();
        assert_eq!(clipped, 2);
        assert_eq!(pdf.values(), &[0., NEG_INF, NEG_INF, NEG_INF]);
    }

    #[test]
    fn combine_all_and_concat() {
        let parts = [
            LnPdf::new(vec![0., 1.]),
            LnPdf::new(vec![1., NEG_INF]),
            LnPdf::new(vec![2., 3.]),
        ];
        let joint = combine_all(&parts).unwrap().unwrap();
        assert_eq!(joint.values(), &[3., NEG_INF]);
        assert!(combine_all(std::iter::empty::<&LnPdf>()).unwrap().is_none());
        assert_eq!(LnPdf::concat(&parts).len(), 6);
    }
}
