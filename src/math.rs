//! Small numeric kernels shared by the model, optimizer and sampler.

#[inline]
pub(crate) fn dot(x: &[f64], y: &[f64]) -> f64 {
    assert!(x.len() == y.len());
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// `y += a * x`
#[inline]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    for (x, y) in x.iter().zip(y.iter_mut()) {
        *y += a * x;
    }
}

#[inline]
pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (denominator `n`, matching the hyperparameter
/// derivation of the source model).
pub(crate) fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

#[inline]
pub(crate) fn squared_norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn kernels() {
        assert_abs_diff_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        let mut y = vec![1.0, 1.0];
        axpy(&[2.0, 3.0], &mut y, 0.5);
        assert_abs_diff_eq!(y[0], 2.0);
        assert_abs_diff_eq!(y[1], 2.5);
        assert_abs_diff_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_abs_diff_eq!(variance(&[1.0, 3.0]), 1.0);
        assert_abs_diff_eq!(squared_norm(&[3.0, 4.0]), 25.0);
    }
}
