//! Density models used as the re-targeting distribution of the harmonic mean
//! estimator.
//!
//! Every model is constructed unfitted from a [`Domain`] and a
//! [`HyperParameters`] record, learns its parameters from training samples
//! in [`DensityModel::fit`], and afterwards evaluates normalised log
//! densities. The estimator only needs the model to be normalised and to
//! have lighter tails than the posterior, so all families here prefer
//! concentrated densities.

mod hyper_sphere;
mod kernel_density;
mod mixture;

pub use hyper_sphere::HyperSphere;
pub use kernel_density::{KernelDensityEstimate, KernelDensityHyperParameters};
pub use mixture::{MixtureHyperParameters, ModifiedGaussianMixtureModel};

use crate::{
    chains::Chains,
    error::{HarmonicError, Result},
};

/// A normalised probability density over the parameter space.
///
/// Models are shared immutably between threads once fitted.
pub trait DensityModel: Send + Sync {
    /// Dimension of the parameter space.
    fn ndim(&self) -> usize;

    /// The search domain of the model's scale parameter.
    fn domain(&self) -> &Domain;

    fn family(&self) -> ModelFamily;

    fn is_fitted(&self) -> bool;

    /// Fit the model to row-major `samples` with one `ln_posterior` value each.
    ///
    /// Returns `Ok(false)` if the underlying optimisation did not converge.
    /// The model is still fitted afterwards and can be evaluated, but its
    /// density may be a poor importance target.
    fn fit(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<bool>;

    /// Log density at `position`.
    ///
    /// Every finite position is inside the model domain. The result is `-inf`
    /// where the model has no support.
    fn predict(&self, position: &[f64]) -> Result<f64>;

    /// Fit the model to all samples of a chain collection.
    fn fit_chains(&mut self, chains: &Chains) -> Result<bool> {
        if chains.ndim() != self.ndim() {
            return Err(HarmonicError::DimensionMismatch {
                expected: self.ndim(),
                found: chains.ndim(),
            });
        }
        self.fit(chains.samples(), chains.ln_posterior())
    }
}

impl<T: DensityModel + ?Sized> DensityModel for Box<T> {
    fn ndim(&self) -> usize {
        (**self).ndim()
    }

    fn domain(&self) -> &Domain {
        (**self).domain()
    }

    fn family(&self) -> ModelFamily {
        (**self).family()
    }

    fn is_fitted(&self) -> bool {
        (**self).is_fitted()
    }

    fn fit(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<bool> {
        (**self).fit(samples, ln_posterior)
    }

    fn predict(&self, position: &[f64]) -> Result<f64> {
        (**self).predict(position)
    }
}

/// Search range of a model's scale parameter.
///
/// For the hyper-sphere this is the radius in units of the per-dimension
/// standard deviation, for the Gaussian mixture the factor applied to the
/// component standard deviations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
    min: f64,
    max: f64,
}

impl Domain {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        let domain = Self { min, max };
        domain.validate()?;
        Ok(domain)
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    fn validate(&self) -> Result<()> {
        let ok = self.min.is_finite() && self.max.is_finite() && 0. < self.min && self.min <= self.max;
        if !ok {
            return Err(HarmonicError::Configuration(format!(
                "domain [{}, {}] must satisfy 0 < min <= max < inf",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self { min: 1e-2, max: 1. }
    }
}

/// The available density model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    HyperSphere,
    ModifiedGaussianMixture,
    KernelDensity,
}

impl ModelFamily {
    /// Construct an unfitted model of this family.
    pub fn build(
        self,
        ndim: usize,
        domain: Domain,
        hyper_parameters: &HyperParameters,
    ) -> Result<Box<dyn DensityModel>> {
        if hyper_parameters.family() != self {
            return Err(HarmonicError::Configuration(format!(
                "hyper-parameters for {:?} cannot configure a {:?} model",
                hyper_parameters.family(),
                self
            )));
        }
        let model: Box<dyn DensityModel> = match hyper_parameters {
            HyperParameters::HyperSphere => Box::new(HyperSphere::new(ndim, domain)?),
            HyperParameters::ModifiedGaussianMixture(params) => {
                Box::new(ModifiedGaussianMixtureModel::new(ndim, domain, *params)?)
            }
            HyperParameters::KernelDensity(params) => {
                Box::new(KernelDensityEstimate::new(ndim, domain, *params)?)
            }
        };
        Ok(model)
    }
}

/// Hyper-parameters of one model configuration, tagged by family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HyperParameters {
    HyperSphere,
    ModifiedGaussianMixture(MixtureHyperParameters),
    KernelDensity(KernelDensityHyperParameters),
}

impl HyperParameters {
    pub fn family(&self) -> ModelFamily {
        match self {
            HyperParameters::HyperSphere => ModelFamily::HyperSphere,
            HyperParameters::ModifiedGaussianMixture(_) => ModelFamily::ModifiedGaussianMixture,
            HyperParameters::KernelDensity(_) => ModelFamily::KernelDensity,
        }
    }
}

/// Check fit input and return the number of samples.
pub(crate) fn check_fit_input(ndim: usize, samples: &[f64], ln_posterior: &[f64]) -> Result<usize> {
    let nsamples = ln_posterior.len();
    if nsamples == 0 {
        return Err(HarmonicError::Configuration(
            "cannot fit a model without samples".into(),
        ));
    }
    if samples.len() != nsamples * ndim {
        return Err(HarmonicError::DimensionMismatch {
            expected: ndim,
            found: samples.len() / nsamples,
        });
    }
    if !samples.iter().chain(ln_posterior).all(|x| x.is_finite()) {
        return Err(HarmonicError::OutOfDomain(
            "training samples and log posterior values must be finite".into(),
        ));
    }
    Ok(nsamples)
}

/// Check a position before evaluating a fitted model.
pub(crate) fn check_position(ndim: usize, fitted: bool, position: &[f64]) -> Result<()> {
    if !fitted {
        return Err(HarmonicError::NotFitted);
    }
    if position.len() != ndim {
        return Err(HarmonicError::DimensionMismatch {
            expected: ndim,
            found: position.len(),
        });
    }
    if let Some(bad) = position.iter().find(|x| !x.is_finite()) {
        return Err(HarmonicError::OutOfDomain(format!(
            "non-finite coordinate {}",
            bad
        )));
    }
    Ok(())
}

/// Relative variance objective `ln Σ φ²/P² − 2 ln Σ φ/P` of the importance
/// estimator on the training samples, given `ln φ − ln P` per sample.
///
/// The constant `ln N` is left out, so only differences between candidate
/// models are meaningful.
pub(crate) fn ln_relative_variance(
    ln_ratios: impl IntoIterator<Item = f64, IntoIter: Clone> + Clone,
) -> f64 {
    let ln_sum = crate::math::logsumexp(ln_ratios.clone());
    let ln_sum_sq = crate::math::logsumexp(ln_ratios.into_iter().map(|x| 2. * x));
    if !ln_sum.is_finite() {
        return f64::INFINITY;
    }
    ln_sum_sq - 2. * ln_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn domains() {
        assert!(Domain::new(0.1, 1.).is_ok());
        assert!(Domain::new(0.5, 0.5).unwrap().contains(0.5));
        for (min, max) in [(0., 1.), (1., 0.5), (-1., 1.), (0.1, f64::INFINITY)] {
            assert!(matches!(
                Domain::new(min, max),
                Err(HarmonicError::Configuration(_))
            ));
        }
    }

    #[test]
    fn build_checks_family() {
        let domain = Domain::default();
        let model = ModelFamily::HyperSphere
            .build(3, domain, &HyperParameters::HyperSphere)
            .unwrap();
        assert_eq!(model.family(), ModelFamily::HyperSphere);
        assert_eq!(model.ndim(), 3);
        assert!(!model.is_fitted());

        let err = ModelFamily::KernelDensity
            .build(3, domain, &HyperParameters::HyperSphere)
            .err()
            .unwrap();
        assert!(matches!(err, HarmonicError::Configuration(_)));
    }

    #[test]
    fn fit_input_checks() {
        assert_eq!(check_fit_input(2, &[0., 1., 2., 3.], &[0., 0.]), Ok(2));
        assert_eq!(
            check_fit_input(2, &[0., 1., 2., 3., 4., 5.], &[0., 0.]),
            Err(HarmonicError::DimensionMismatch {
                expected: 2,
                found: 3
            })
        );
        assert!(check_fit_input(2, &[], &[]).is_err());
        assert!(matches!(
            check_fit_input(1, &[f64::NAN], &[0.]),
            Err(HarmonicError::OutOfDomain(_))
        ));
    }

    #[test]
    fn position_checks() {
        assert_eq!(check_position(2, false, &[0., 0.]), Err(HarmonicError::NotFitted));
        assert!(matches!(
            check_position(2, true, &[0., f64::INFINITY]),
            Err(HarmonicError::OutOfDomain(_))
        ));
        assert!(check_position(2, true, &[0.]).is_err());
        assert!(check_position(2, true, &[0., 1.]).is_ok());
    }

    #[test]
    fn relative_variance_prefers_even_weights() {
        let even = ln_relative_variance([0f64; 4]);
        let uneven = ln_relative_variance([0., 0., 0., 3.]);
        assert!((even - (0.25f64).ln()).abs() < 1e-12);
        assert!(uneven > even);
        assert_eq!(ln_relative_variance([f64::NEG_INFINITY; 2]), f64::INFINITY);
    }
}
