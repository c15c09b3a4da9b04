use faer::Col;
use itertools::{izip, Itertools};
use tracing::debug;

use crate::{
    error::{HarmonicError, Result},
    math::{column_moments, ln_ball_volume, logaddexp},
    model::{check_fit_input, check_position, DensityModel, Domain, ModelFamily},
};

/// Uniform density on an ellipsoid aligned with the coordinate axes.
///
/// The ellipsoid is centred on the sample mean and scaled by the sample
/// standard deviations. Its radius, in units of standard deviations, is
/// chosen from the domain to minimise the variance of the estimator on the
/// training samples.
#[derive(Debug, Clone)]
pub struct HyperSphere {
    ndim: usize,
    domain: Domain,
    centre: Col<f64>,
    inv_covariance: Col<f64>,
    radius: f64,
    ln_volume: f64,
    fitted: bool,
}

impl HyperSphere {
    pub fn new(ndim: usize, domain: Domain) -> Result<Self> {
        if ndim == 0 {
            return Err(HarmonicError::Configuration(
                "hyper-sphere needs at least one dimension".into(),
            ));
        }
        let mut sphere = Self {
            ndim,
            domain,
            centre: Col::zeros(ndim),
            inv_covariance: Col::zeros(ndim),
            radius: domain.max(),
            ln_volume: 0.,
            fitted: false,
        };
        sphere
            .inv_covariance
            .try_as_col_major_mut().unwrap().as_slice_mut()
            .iter_mut()
            .for_each(|x| *x = 1.);
        sphere.set_radius(domain.max());
        Ok(sphere)
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn centre(&self) -> &[f64] {
        self.centre.try_as_col_major().unwrap().as_slice()
    }

    pub fn inv_covariance(&self) -> &[f64] {
        self.inv_covariance.try_as_col_major().unwrap().as_slice()
    }

    /// Log volume of the current ellipsoid.
    pub fn ln_volume(&self) -> f64 {
        self.ln_volume
    }

    fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        let ln_det_inv_cov: f64 = self.inv_covariance.try_as_col_major().unwrap().as_slice().iter().map(|x| x.ln()).sum();
        self.ln_volume = ln_ball_volume(self.ndim, radius) - 0.5 * ln_det_inv_cov;
    }

    /// Squared radius of `position` in units of standard deviations.
    fn whitened_radius_sq(&self, position: &[f64]) -> f64 {
        izip!(position, self.centre.try_as_col_major().unwrap().as_slice(), self.inv_covariance.try_as_col_major().unwrap().as_slice())
            .map(|(&x, &c, &inv)| (x - c) * (x - c) * inv)
            .sum()
    }
}

impl DensityModel for HyperSphere {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::HyperSphere
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn fit(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<bool> {
        check_fit_input(self.ndim, samples, ln_posterior)?;

        let (mean, variance) = column_moments(samples, self.ndim);
        self.centre = mean;
        izip!(self.inv_covariance.try_as_col_major_mut().unwrap().as_slice_mut(), variance.try_as_col_major().unwrap().as_slice()).for_each(|(inv, &var)| {
            // A constant coordinate gets a unit scale
            *inv = if var > 0. { var.recip() } else { 1. };
        });

        // Grow the radius over the sorted sample radii. Inside the sphere every
        // sample contributes 1 / (V P), the volume cancels in the relative
        // variance, so the objective only depends on which samples are inside.
        let by_radius = samples
            .chunks_exact(self.ndim)
            .zip(ln_posterior)
            .map(|(x, &lnp)| (self.whitened_radius_sq(x).sqrt(), lnp))
            .sorted_by(|a, b| a.0.total_cmp(&b.0))
            .collect_vec();

        let mut ln_sum = f64::NEG_INFINITY;
        let mut ln_sum_sq = f64::NEG_INFINITY;
        let mut best: Option<(f64, f64)> = None;
        for (i, &(radius, lnp)) in by_radius.iter().enumerate() {
            if radius > self.domain.max() {
                break;
            }
            ln_sum = logaddexp(ln_sum, -lnp);
            ln_sum_sq = logaddexp(ln_sum_sq, -2. * lnp);

            // Only evaluate once every sample within the candidate radius is in
            let candidate = radius.max(self.domain.min());
            let incomplete = by_radius
                .get(i + 1)
                .is_some_and(|&(next, _)| next <= candidate);
            if incomplete {
                continue;
            }

            let objective = ln_sum_sq - 2. * ln_sum;
            if best.map_or(true, |(_, value)| objective < value) {
                best = Some((candidate, objective));
            }
        }

        self.fitted = true;
        match best {
            Some((radius, objective)) if objective.is_finite() => {
                self.set_radius(radius);
                debug!(radius, objective, "fitted hyper-sphere");
                Ok(true)
            }
            _ => {
                self.set_radius(self.domain.max());
                debug!(
                    radius = self.radius,
                    "no training sample inside the hyper-sphere domain"
                );
                Ok(false)
            }
        }
    }

    fn predict(&self, position: &[f64]) -> Result<f64> {
        check_position(self.ndim, self.fitted, position)?;
        if self.whitened_radius_sq(position) <= self.radius * self.radius {
            Ok(-self.ln_volume)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }
}
