use std::f64::consts::PI;

use faer::{Col, Mat};
use itertools::izip;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    error::{HarmonicError, Result},
    math::{column_moments, golden_section_minimize, logsumexp},
    model::{
        check_fit_input, check_position, ln_relative_variance, DensityModel, Domain, ModelFamily,
    },
};

const MIN_COMPONENT_WEIGHT: f64 = 1e-10;
const SCALE_SEARCH_ITER: usize = 80;

/// Settings of the modified Gaussian mixture model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixtureHyperParameters {
    /// Number of Gaussian components.
    pub ngaussians: usize,
    /// Added to every component variance after each update.
    pub regularisation: f64,
    /// Damping of the EM updates. With 1 every iteration is a plain EM step.
    pub learning_rate: f64,
    /// Maximum number of EM iterations.
    pub max_iter: usize,
    /// Convergence threshold on the change of the mean log likelihood.
    pub tolerance: f64,
    /// Seed of the k-means++ initialisation.
    pub seed: u64,
}

impl Default for MixtureHyperParameters {
    fn default() -> Self {
        Self {
            ngaussians: 3,
            regularisation: 1e-8,
            learning_rate: 1.,
            max_iter: 200,
            tolerance: 1e-6,
            seed: 0,
        }
    }
}

impl MixtureHyperParameters {
    fn validate(&self) -> Result<()> {
        let problem = if self.ngaussians == 0 {
            Some("ngaussians must be positive")
        } else if !(self.regularisation.is_finite() && self.regularisation >= 0.) {
            Some("regularisation must be finite and non-negative")
        } else if !(self.learning_rate > 0. && self.learning_rate <= 1.) {
            Some("learning rate must be in (0, 1]")
        } else if self.max_iter == 0 {
            Some("max_iter must be positive")
        } else if !(self.tolerance.is_finite() && self.tolerance > 0.) {
            Some("tolerance must be finite and positive")
        } else {
            None
        };
        match problem {
            Some(msg) => Err(HarmonicError::Configuration(format!("{}: {:?}", msg, self))),
            None => Ok(()),
        }
    }
}

/// Mixture of axis-aligned Gaussians with a shared covariance scale.
///
/// Components are fitted to the samples with damped expectation
/// maximisation. The component covariances are then multiplied by a common
/// factor `scale²`, with `scale` taken from the domain so that the variance
/// of the estimator on the training samples is minimal. Scales below one
/// shrink the mixture inside the posterior bulk.
#[derive(Debug, Clone)]
pub struct ModifiedGaussianMixtureModel {
    ndim: usize,
    domain: Domain,
    params: MixtureHyperParameters,
    weights: Col<f64>,
    means: Mat<f64>,
    variances: Mat<f64>,
    scale: f64,
    fitted: bool,
}

/// Posterior component probabilities of every sample, `nsamples × ncomponents`.
struct Responsibilities {
    values: Vec<f64>,
    ncomponents: usize,
}

impl ModifiedGaussianMixtureModel {
    pub fn new(ndim: usize, domain: Domain, params: MixtureHyperParameters) -> Result<Self> {
        if ndim == 0 {
            return Err(HarmonicError::Configuration(
                "mixture model needs at least one dimension".into(),
            ));
        }
        params.validate()?;
        Ok(Self {
            ndim,
            domain,
            params,
            weights: Col::zeros(0),
            means: Mat::zeros(0, ndim),
            variances: Mat::zeros(0, ndim),
            scale: domain.max(),
            fitted: false,
        })
    }

    pub fn hyper_parameters(&self) -> &MixtureHyperParameters {
        &self.params
    }

    /// Number of fitted components.
    pub fn ncomponents(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &[f64] {
        self.weights.try_as_col_major().unwrap().as_slice()
    }

    pub fn mean(&self, component: usize) -> Vec<f64> {
        (0..self.ndim).map(|j| self.means[(component, j)]).collect()
    }

    /// Variances of a component before scaling.
    pub fn variance(&self, component: usize) -> Vec<f64> {
        (0..self.ndim).map(|j| self.variances[(component, j)]).collect()
    }

    /// The covariance scale chosen from the domain.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn component_ln_density(&self, component: usize, position: &[f64], ln_scale: f64) -> f64 {
        let scale_sq = (2. * ln_scale).exp();
        let mut value = 0.;
        for (j, &x) in position.iter().enumerate() {
            let var = self.variances[(component, j)] * scale_sq;
            let diff = x - self.means[(component, j)];
            value -= 0.5 * ((2. * PI * var).ln() + diff * diff / var);
        }
        value
    }

    fn ln_density(&self, position: &[f64], ln_scale: f64) -> f64 {
        logsumexp(
            self.weights
                .try_as_col_major().unwrap().as_slice()
                .iter()
                .enumerate()
                .map(|(k, &w)| w.ln() + self.component_ln_density(k, position, ln_scale)),
        )
    }

    /// Choose initial centres with k-means++, distances whitened by `global_var`.
    fn initial_centres(&self, samples: &[f64], global_var: &[f64], ncomponents: usize) -> Vec<usize> {
        let mut rng = SmallRng::seed_from_u64(self.params.seed);
        let nsamples = samples.len() / self.ndim;
        let dist_sq = |a: &[f64], b: &[f64]| -> f64 {
            izip!(a, b, global_var)
                .map(|(x, y, v)| (x - y) * (x - y) / v)
                .sum()
        };

        let mut centres = vec![rng.random_range(0..nsamples)];
        let mut nearest: Vec<f64> = samples
            .chunks_exact(self.ndim)
            .map(|x| dist_sq(x, &samples[centres[0] * self.ndim..(centres[0] + 1) * self.ndim]))
            .collect();

        while centres.len() < ncomponents {
            let total: f64 = nearest.iter().sum();
            let next = if total > 0. {
                let target = rng.random::<f64>() * total;
                let mut acc = 0.;
                nearest
                    .iter()
                    .position(|&d| {
                        acc += d;
                        acc > target
                    })
                    .unwrap_or(nsamples - 1)
            } else {
                rng.random_range(0..nsamples)
            };
            centres.push(next);
            let centre = &samples[next * self.ndim..(next + 1) * self.ndim];
            izip!(nearest.iter_mut(), samples.chunks_exact(self.ndim))
                .for_each(|(d, x)| *d = d.min(dist_sq(x, centre)));
        }
        centres
    }

    /// Hard assignment of every sample to its closest centre.
    fn assign(&self, samples: &[f64], global_var: &[f64], centres: &[usize]) -> Responsibilities {
        let ncomponents = centres.len();
        let mut values = vec![0.; samples.len() / self.ndim * ncomponents];
        izip!(values.chunks_exact_mut(ncomponents), samples.chunks_exact(self.ndim)).for_each(
            |(resp, x)| {
                let closest = centres
                    .iter()
                    .map(|&c| {
                        let centre = &samples[c * self.ndim..(c + 1) * self.ndim];
                        izip!(x, centre, global_var)
                            .map(|(a, b, v)| (a - b) * (a - b) / v)
                            .sum::<f64>()
                    })
                    .enumerate()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(k, _)| k)
                    .unwrap_or(0);
                resp[closest] = 1.;
            },
        );
        Responsibilities {
            values,
            ncomponents,
        }
    }

    /// Component probabilities of every sample and the mean log likelihood.
    fn expectation(&self, samples: &[f64]) -> (Responsibilities, f64) {
        let ncomponents = self.ncomponents();
        let mut values = vec![0.; samples.len() / self.ndim * ncomponents];
        let ln_norms: Vec<f64> = values
            .par_chunks_mut(ncomponents)
            .zip(samples.par_chunks(self.ndim))
            .map(|(resp, x)| {
                resp.iter_mut().enumerate().for_each(|(k, r)| {
                    *r = self.weights.try_as_col_major().unwrap().as_slice()[k].ln() + self.component_ln_density(k, x, 0.);
                });
                let norm = logsumexp(resp.iter().copied());
                resp.iter_mut().for_each(|r| *r = (*r - norm).exp());
                norm
            })
            .collect();
        let mean_loglik = ln_norms.iter().sum::<f64>() / ln_norms.len() as f64;
        (
            Responsibilities {
                values,
                ncomponents,
            },
            mean_loglik,
        )
    }

    /// Maximisation step, damped by the learning rate.
    ///
    /// Returns false without touching the parameters if a component lost all
    /// of its samples.
    fn maximisation(&mut self, samples: &[f64], resp: &Responsibilities, learning_rate: f64) -> bool {
        let ncomponents = resp.ncomponents;
        let nsamples = samples.len() / self.ndim;

        let mut counts = vec![0.; ncomponents];
        let mut means = Mat::<f64>::zeros(ncomponents, self.ndim);
        for (r, x) in izip!(resp.values.chunks_exact(ncomponents), samples.chunks_exact(self.ndim)) {
            for k in 0..ncomponents {
                counts[k] += r[k];
                for (j, &xj) in x.iter().enumerate() {
                    means[(k, j)] += r[k] * xj;
                }
            }
        }
        if counts
            .iter()
            .any(|&n| !(n / nsamples as f64 > MIN_COMPONENT_WEIGHT))
        {
            return false;
        }
        for (k, &n) in counts.iter().enumerate() {
            for j in 0..self.ndim {
                means[(k, j)] /= n;
            }
        }

        let mut variances = Mat::<f64>::zeros(ncomponents, self.ndim);
        for (r, x) in izip!(resp.values.chunks_exact(ncomponents), samples.chunks_exact(self.ndim)) {
            for k in 0..ncomponents {
                for (j, &xj) in x.iter().enumerate() {
                    let diff = xj - means[(k, j)];
                    variances[(k, j)] += r[k] * diff * diff;
                }
            }
        }
        for (k, &n) in counts.iter().enumerate() {
            for j in 0..self.ndim {
                variances[(k, j)] = variances[(k, j)] / n + self.params.regularisation;
            }
        }
        if (0..ncomponents).any(|k| (0..self.ndim).any(|j| !(variances[(k, j)] > 0.))) {
            return false;
        }

        let first = self.weights.nrows() != ncomponents;
        if first {
            self.weights = Col::zeros(ncomponents);
            self.means = means;
            self.variances = variances;
            izip!(self.weights.try_as_col_major_mut().unwrap().as_slice_mut(), &counts)
                .for_each(|(w, &n)| *w = n / nsamples as f64);
            return true;
        }

        let eta = learning_rate;
        izip!(self.weights.try_as_col_major_mut().unwrap().as_slice_mut(), &counts)
            .for_each(|(w, &n)| *w += eta * (n / nsamples as f64 - *w));
        for k in 0..ncomponents {
            for j in 0..self.ndim {
                self.means[(k, j)] += eta * (means[(k, j)] - self.means[(k, j)]);
                self.variances[(k, j)] += eta * (variances[(k, j)] - self.variances[(k, j)]);
            }
        }
        true
    }

    /// Single component matching the sample moments.
    fn set_broad_component(&mut self, mean: &[f64], variance: &[f64]) {
        self.weights = Col::zeros(1);
        self.weights.try_as_col_major_mut().unwrap().as_slice_mut()[0] = 1.;
        self.means = Mat::zeros(1, self.ndim);
        self.variances = Mat::zeros(1, self.ndim);
        for j in 0..self.ndim {
            self.means[(0, j)] = mean[j];
            self.variances[(0, j)] = variance[j];
        }
    }

    /// Expectation maximisation. Returns whether it converged.
    fn expectation_maximisation(&mut self, samples: &[f64], global_var: &[f64]) -> bool {
        let centres = self.initial_centres(samples, global_var, self.params.ngaussians);
        let hard = self.assign(samples, global_var, &centres);
        self.weights = Col::zeros(0);
        if !self.maximisation(samples, &hard, 1.) {
            debug!("k-means initialisation left an empty component");
            return false;
        }

        let mut previous = f64::NEG_INFINITY;
        for iter in 0..self.params.max_iter {
            let (resp, mean_loglik) = self.expectation(samples);
            if !mean_loglik.is_finite() {
                debug!(iter, "non-finite log likelihood in expectation step");
                return false;
            }
            if (mean_loglik - previous).abs() < self.params.tolerance {
                debug!(iter, mean_loglik, "expectation maximisation converged");
                return true;
            }
            previous = mean_loglik;
            if !self.maximisation(samples, &resp, self.params.learning_rate) {
                debug!(iter, "mixture component collapsed");
                return false;
            }
        }
        debug!(
            max_iter = self.params.max_iter,
            "expectation maximisation did not converge"
        );
        false
    }

    /// Pick the covariance scale from the domain.
    fn fit_scale(&mut self, samples: &[f64], ln_posterior: &[f64]) -> bool {
        let objective = |ln_scale: f64| {
            let ratios: Vec<f64> = samples
                .par_chunks(self.ndim)
                .zip(ln_posterior.par_iter())
                .map(|(x, &lnp)| self.ln_density(x, ln_scale) - lnp)
                .collect();
            ln_relative_variance(ratios.iter().copied())
        };

        let (ln_min, ln_max) = (self.domain.min().ln(), self.domain.max().ln());
        let (ln_scale, value) = if ln_min == ln_max {
            (ln_min, objective(ln_min))
        } else {
            golden_section_minimize(objective, ln_min, ln_max, SCALE_SEARCH_ITER)
        };
        self.scale = ln_scale.exp();
        debug!(scale = self.scale, objective = value, "fitted mixture scale");
        value.is_finite()
    }
}

impl DensityModel for ModifiedGaussianMixtureModel {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::ModifiedGaussianMixture
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn fit(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<bool> {
        let nsamples = check_fit_input(self.ndim, samples, ln_posterior)?;

        let (global_mean, mut global_var) = column_moments(samples, self.ndim);
        global_var
            .try_as_col_major_mut().unwrap().as_slice_mut()
            .iter_mut()
            .for_each(|v| *v = (if *v > 0. { *v } else { 1. }) + self.params.regularisation);

        let converged = if self.params.ngaussians > nsamples {
            warn!(
                ngaussians = self.params.ngaussians,
                nsamples, "more mixture components than samples"
            );
            false
        } else {
            self.expectation_maximisation(samples, global_var.try_as_col_major().unwrap().as_slice())
        };
        if !converged {
            // Keep the last valid parameters, otherwise fall back to one component
            let valid = self.ncomponents() > 0
                && self.weights.try_as_col_major().unwrap().as_slice().iter().all(|w| w.is_finite() && *w > 0.);
            if !valid {
                self.set_broad_component(global_mean.try_as_col_major().unwrap().as_slice(), global_var.try_as_col_major().unwrap().as_slice());
            }
        }

        let scale_ok = self.fit_scale(samples, ln_posterior);
        self.fitted = true;
        Ok(converged && scale_ok)
    }

    fn predict(&self, position: &[f64]) -> Result<f64> {
        check_position(self.ndim, self.fitted, position)?;
        Ok(self.ln_density(position, self.scale.ln()))
    }
}
