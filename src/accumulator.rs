//! Running log-space sums of the harmonic mean terms of one chain.

use crate::math::logaddexp;

/// Smallest and largest finite value seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrema {
    pub min: f64,
    pub max: f64,
}

impl Default for Extrema {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Extrema {
    pub(crate) fn add(&mut self, value: f64) {
        if value.is_finite() {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    pub(crate) fn merge(&mut self, other: &Extrema) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// True until a finite value was added.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Accumulates `exp(lnarg)` terms of one chain without overflow.
///
/// The sums are kept as `ln Σ exp(lnarg)` and `ln Σ exp(2 lnarg)`, so a
/// shift can be chosen after all samples are seen.
#[derive(Debug, Clone, PartialEq)]
pub struct TermAccumulator {
    nsamples: u64,
    ndropped: u64,
    ln_sum: f64,
    ln_sum_sq: f64,
    finite_sum: f64,
    nfinite: u64,
    lnarg: Extrema,
    ln_posterior: Extrema,
    ln_predict: Extrema,
}

impl Default for TermAccumulator {
    fn default() -> Self {
        Self {
            nsamples: 0,
            ndropped: 0,
            ln_sum: f64::NEG_INFINITY,
            ln_sum_sq: f64::NEG_INFINITY,
            finite_sum: 0.,
            nfinite: 0,
            lnarg: Extrema::default(),
            ln_posterior: Extrema::default(),
            ln_predict: Extrema::default(),
        }
    }
}

impl TermAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sample with model log density `ln_predict`.
    ///
    /// `ln_predict` may be `-inf`, the term is then zero but the sample
    /// still counts.
    pub fn add_sample(&mut self, ln_predict: f64, ln_posterior: f64) {
        let lnarg = ln_predict - ln_posterior;
        self.nsamples += 1;
        self.ln_sum = logaddexp(self.ln_sum, lnarg);
        self.ln_sum_sq = logaddexp(self.ln_sum_sq, 2. * lnarg);
        if lnarg.is_finite() {
            self.finite_sum += lnarg;
            self.nfinite += 1;
        }
        self.lnarg.add(lnarg);
        self.ln_posterior.add(ln_posterior);
        self.ln_predict.add(ln_predict);
    }

    /// Record a sample excluded from the sums.
    pub fn add_dropped(&mut self) {
        self.ndropped += 1;
    }

    /// Combine with the accumulator of other samples of the same chain.
    pub fn merge(&mut self, other: &TermAccumulator) {
        self.nsamples += other.nsamples;
        self.ndropped += other.ndropped;
        self.ln_sum = logaddexp(self.ln_sum, other.ln_sum);
        self.ln_sum_sq = logaddexp(self.ln_sum_sq, other.ln_sum_sq);
        self.finite_sum += other.finite_sum;
        self.nfinite += other.nfinite;
        self.lnarg.merge(&other.lnarg);
        self.ln_posterior.merge(&other.ln_posterior);
        self.ln_predict.merge(&other.ln_predict);
    }

    pub fn nsamples(&self) -> u64 {
        self.nsamples
    }

    pub fn ndropped(&self) -> u64 {
        self.ndropped
    }

    /// `ln Σ exp(lnarg)`.
    pub fn ln_sum(&self) -> f64 {
        self.ln_sum
    }

    /// `ln Σ exp(2 lnarg)`.
    pub fn ln_sum_sq(&self) -> f64 {
        self.ln_sum_sq
    }

    /// Sum and count of the finite `lnarg` values.
    pub fn finite_lnargs(&self) -> (f64, u64) {
        (self.finite_sum, self.nfinite)
    }

    pub fn lnarg(&self) -> &Extrema {
        &self.lnarg
    }

    pub fn ln_posterior(&self) -> &Extrema {
        &self.ln_posterior
    }

    pub fn ln_predict(&self) -> &Extrema {
        &self.ln_predict
    }

    /// Importance-weight effective sample size `(Σ w)² / Σ w²`.
    pub fn effective_nsamples(&self) -> f64 {
        if self.ln_sum == f64::NEG_INFINITY {
            return 0.;
        }
        (2. * self.ln_sum - self.ln_sum_sq).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn accumulate(terms: &[(f64, f64)]) -> TermAccumulator {
        let mut acc = TermAccumulator::new();
        for &(pred, post) in terms {
            acc.add_sample(pred, post);
        }
        acc
    }

    fn assert_close(a: &TermAccumulator, b: &TermAccumulator) {
        assert_eq!(a.nsamples(), b.nsamples());
        assert_eq!(a.ndropped(), b.ndropped());
        assert_eq!(a.lnarg(), b.lnarg());
        assert_eq!(a.ln_predict(), b.ln_predict());
        assert!((a.ln_sum() - b.ln_sum()).abs() < 1e-10);
        assert!((a.ln_sum_sq() - b.ln_sum_sq()).abs() < 1e-10);
        assert!((a.finite_lnargs().0 - b.finite_lnargs().0).abs() < 1e-8);
    }

    #[test]
    fn sums_in_log_space() {
        let acc = accumulate(&[(0., 1.), (1., 0.), (f64::NEG_INFINITY, 0.)]);
        assert_eq!(acc.nsamples(), 3);
        let expected = ((-1f64).exp() + 1f64.exp()).ln();
        assert!((acc.ln_sum() - expected).abs() < 1e-12);
        assert_eq!(acc.finite_lnargs(), (0., 2));
        assert_eq!(acc.lnarg(), &Extrema { min: -1., max: 1. });
        assert_eq!(acc.ln_predict(), &Extrema { min: 0., max: 1. });
    }

    #[test]
    fn equal_weights_have_full_ess() {
        let acc = accumulate(&[(-3., -1.); 10]);
        assert!((acc.effective_nsamples() - 10.).abs() < 1e-9);
        assert_eq!(TermAccumulator::new().effective_nsamples(), 0.);
        assert!(TermAccumulator::new().lnarg().is_empty());
    }

    proptest! {
        #[test]
        fn merge_is_associative(
            terms in proptest::collection::vec((-50f64..50., -50f64..50.), 3..40),
            cut in (0.0f64..1., 0.0f64..1.),
        ) {
            let n = terms.len();
            let (i, j) = {
                let a = (cut.0 * n as f64) as usize;
                let b = (cut.1 * n as f64) as usize;
                (a.min(b), a.max(b))
            };
            let a = accumulate(&terms[..i]);
            let b = accumulate(&terms[i..j]);
            let c = accumulate(&terms[j..]);

            let mut left = a.clone();
            left.merge(&b);
            left.merge(&c);

            let mut bc = b.clone();
            bc.merge(&c);
            let mut right = a.clone();
            right.merge(&bc);

            let mut reversed = c.clone();
            reversed.merge(&b);
            reversed.merge(&a);

            let whole = accumulate(&terms);
            assert_close(&left, &right);
            assert_close(&left, &whole);
            assert_close(&reversed, &whole);
        }
    }
}
