use faer::Col;
use itertools::izip;
use statrs::function::gamma::ln_gamma;

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

/// `ln Σ exp(x)` over all values, shifted by the maximum.
///
/// Returns `-inf` for an empty iterator or if all values are `-inf`.
pub(crate) fn logsumexp(values: impl IntoIterator<Item = f64> + Clone) -> f64 {
    let max = values
        .clone()
        .into_iter()
        .fold(f64::NEG_INFINITY, |acc, x| acc.max(x));
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.into_iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Log volume of the `ndim`-dimensional ball with the given radius.
pub(crate) fn ln_ball_volume(ndim: usize, radius: f64) -> f64 {
    let d = ndim as f64;
    0.5 * d * std::f64::consts::PI.ln() - ln_gamma(0.5 * d + 1.) + d * radius.ln()
}

/// Per-dimension mean and (biased) variance of a row-major sample matrix.
pub(crate) fn column_moments(samples: &[f64], ndim: usize) -> (Col<f64>, Col<f64>) {
    let mut mean = Col::<f64>::zeros(ndim);
    let mut variance = Col::<f64>::zeros(ndim);
    let nsamples = samples.len() / ndim;
    if nsamples == 0 {
        return (mean, variance);
    }

    for row in samples.chunks_exact(ndim) {
        izip!(mean.try_as_col_major_mut().unwrap().as_slice_mut(), row).for_each(|(m, &x)| *m += x);
    }
    mean.try_as_col_major_mut().unwrap().as_slice_mut()
        .iter_mut()
        .for_each(|m| *m /= nsamples as f64);

    for row in samples.chunks_exact(ndim) {
        izip!(variance.try_as_col_major_mut().unwrap().as_slice_mut(), mean.try_as_col_major().unwrap().as_slice(), row).for_each(|(v, &m, &x)| {
            let diff = x - m;
            *v += diff * diff;
        });
    }
    variance
        .try_as_col_major_mut().unwrap().as_slice_mut()
        .iter_mut()
        .for_each(|v| *v /= nsamples as f64);

    (mean, variance)
}

const INV_GOLDEN: f64 = 0.618_033_988_749_894_9;

/// Minimise a unimodal function on `[lower, upper]` by golden-section search.
///
/// Non-finite objective values are treated as `+inf`. Returns the best
/// point seen together with its objective value.
pub(crate) fn golden_section_minimize<F>(
    mut objective: F,
    lower: f64,
    upper: f64,
    max_iter: usize,
) -> (f64, f64)
where
    F: FnMut(f64) -> f64,
{
    let mut eval = |x: f64| {
        let val = objective(x);
        if val.is_nan() {
            f64::INFINITY
        } else {
            val
        }
    };

    let (mut a, mut b) = (lower, upper);
    let mut c = b - INV_GOLDEN * (b - a);
    let mut d = a + INV_GOLDEN * (b - a);
    let mut fc = eval(c);
    let mut fd = eval(d);

    let mut best = if fc <= fd { (c, fc) } else { (d, fd) };
    for (x, fx) in [(lower, eval(lower)), (upper, eval(upper))] {
        if fx < best.1 {
            best = (x, fx);
        }
    }

    for _ in 0..max_iter {
        if (b - a).abs() <= 1e-10 * (1. + a.abs() + b.abs()) {
            break;
        }
        if fc <= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_GOLDEN * (b - a);
            fc = eval(c);
            if fc < best.1 {
                best = (c, fc);
            }
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_GOLDEN * (b - a);
            fd = eval(d);
            if fd < best.1 {
                best = (d, fd);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_logsumexp(values in proptest::collection::vec(-700f64..700f64, 1..20)) {
            let direct = values
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, logaddexp);
            let lse = logsumexp(values.iter().copied());
            prop_assert!((direct - lse).abs() < 1e-9 * (1. + lse.abs()));
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
        assert_eq!(logsumexp(std::iter::empty::<f64>()), f64::NEG_INFINITY);
        assert_eq!(logsumexp([f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
    }

    #[test]
    fn ball_volumes() {
        let pi = std::f64::consts::PI;
        assert!((ln_ball_volume(1, 2.) - 4f64.ln()).abs() < 1e-12);
        assert!((ln_ball_volume(2, 1.5) - (pi * 2.25).ln()).abs() < 1e-12);
        assert!((ln_ball_volume(3, 1.) - (4. / 3. * pi).ln()).abs() < 1e-12);
    }

    #[test]
    fn moments_of_columns() {
        let samples = [1., 10., 2., 20., 3., 30.];
        let (mean, var) = column_moments(&samples, 2);
        assert_eq!(mean.try_as_col_major().unwrap().as_slice(), &[2., 20.]);
        assert!((var.try_as_col_major().unwrap().as_slice()[0] - 2. / 3.).abs() < 1e-12);
        assert!((var.try_as_col_major().unwrap().as_slice()[1] - 200. / 3.).abs() < 1e-12);
    }

    #[test]
    fn golden_section_finds_parabola_minimum() {
        let (x, fx) = golden_section_minimize(|x| (x - 0.3).powi(2) + 1., 0., 2., 100);
        assert!((x - 0.3).abs() < 1e-6);
        assert!((fx - 1.).abs() < 1e-10);

        // Minimum clipped at the boundary
        let (x, _) = golden_section_minimize(|x| x, 0.5, 2., 100);
        assert_eq!(x, 0.5);
    }
}
