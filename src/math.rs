#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Log of the sum of exponentials, stable for large magnitudes.
///
/// Returns negative infinity for an empty slice or one that only contains
/// negative infinity.
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| (v - max).exp())
        .sum();
    max + sum.ln()
}
