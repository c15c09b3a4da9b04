use std::f64::consts::PI;

use anyhow::Result;
use approx::assert_abs_diff_eq;
use harmonic_evidence::{
    cross_validation, split_data, Chains, CrossValidationSettings, DensityModel, Domain,
    Evidence, EvidenceSettings, HarmonicError, HyperParameters, HyperSphere,
    MixtureHyperParameters, ModelFamily, ModifiedGaussianMixtureModel,
};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Prior `N(0, τ²)` and one observation `y ~ N(θ, σ²)`.
struct Conjugate {
    prior_std: f64,
    noise_std: f64,
    observed: f64,
}

impl Conjugate {
    fn ln_normal(x: f64, mean: f64, var: f64) -> f64 {
        -0.5 * ((2. * PI * var).ln() + (x - mean) * (x - mean) / var)
    }

    /// `ln L(θ) + ln π(θ)`.
    fn ln_posterior(&self, theta: f64) -> f64 {
        Self::ln_normal(self.observed, theta, self.noise_std.powi(2))
            + Self::ln_normal(theta, 0., self.prior_std.powi(2))
    }

    fn ln_evidence(&self) -> f64 {
        Self::ln_normal(
            self.observed,
            0.,
            self.prior_std.powi(2) + self.noise_std.powi(2),
        )
    }

    fn posterior_moments(&self) -> (f64, f64) {
        let var = (self.prior_std.powi(-2) + self.noise_std.powi(-2)).recip();
        (var * self.observed / self.noise_std.powi(2), var)
    }

    /// Independent posterior draws, grouped into chains.
    fn chains(&self, nchains: usize, nsamples: usize, seed: u64) -> Result<Chains> {
        let (mean, var) = self.posterior_moments();
        let normal = Normal::new(mean, var.sqrt())?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut chains = Chains::new(1)?;
        for _ in 0..nchains {
            let samples: Vec<f64> = (0..nsamples).map(|_| normal.sample(&mut rng)).collect();
            let ln_posterior: Vec<f64> = samples.iter().map(|&t| self.ln_posterior(t)).collect();
            chains.add_chain(&samples, &ln_posterior)?;
        }
        Ok(chains)
    }
}

fn problem() -> Conjugate {
    Conjugate {
        prior_std: 3.,
        noise_std: 0.5,
        observed: 1.2,
    }
}

/// The normalised posterior itself.
struct ExactPosterior {
    mean: f64,
    var: f64,
    domain: Domain,
}

impl DensityModel for ExactPosterior {
    fn ndim(&self) -> usize {
        1
    }

    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::ModifiedGaussianMixture
    }

    fn is_fitted(&self) -> bool {
        true
    }

    fn fit(&mut self, _samples: &[f64], _ln_posterior: &[f64]) -> Result<bool, HarmonicError> {
        Ok(true)
    }

    fn predict(&self, position: &[f64]) -> Result<f64, HarmonicError> {
        Ok(Conjugate::ln_normal(position[0], self.mean, self.var))
    }
}

#[test]
fn exact_model_gives_exact_evidence() -> Result<()> {
    let problem = problem();
    let chains = problem.chains(4, 100, 1)?;
    let (mean, var) = problem.posterior_moments();
    let model = ExactPosterior {
        mean,
        var,
        domain: Domain::default(),
    };

    let mut evidence = Evidence::new(chains.nchains(), &model, EvidenceSettings::default())?;
    evidence.add_chains(&chains)?;
    let summary = evidence.finalize()?;
    assert_abs_diff_eq!(
        summary.ln_evidence_inv,
        -problem.ln_evidence(),
        epsilon = 1e-10
    );
    assert_abs_diff_eq!(summary.ln_evidence(), problem.ln_evidence(), epsilon = 1e-10);
    Ok(())
}

#[test]
fn learnt_mixture_recovers_evidence() -> Result<()> {
    let problem = problem();
    let chains = problem.chains(20, 2000, 2)?;
    let (train, test) = split_data(&chains, 0.5, 0)?;

    let params = MixtureHyperParameters {
        ngaussians: 1,
        ..Default::default()
    };
    let mut model = ModifiedGaussianMixtureModel::new(1, Domain::new(0.1, 1.)?, params)?;
    assert!(model.fit_chains(&train)?);
    assert!(model.domain().contains(model.scale()));

    let mut evidence = Evidence::new(test.nchains(), &model, EvidenceSettings::default())?;
    evidence.add_chains(&test)?;
    let summary = evidence.finalize()?;
    assert!((summary.ln_evidence_inv + problem.ln_evidence()).abs() < 0.05);
    assert!(summary.evidence_inv_var().is_finite());
    assert_eq!(summary.ndropped_per_chain, vec![0; 10]);
    assert!(summary.diagnostics().mean_nsamples_eff_per_chain > 30.);
    Ok(())
}

#[test]
fn learnt_hyper_sphere_recovers_evidence() -> Result<()> {
    let problem = problem();
    let chains = problem.chains(20, 2000, 3)?;
    let (train, test) = split_data(&chains, 0.5, 1)?;

    let mut sphere = HyperSphere::new(1, Domain::new(0.1, 3.)?)?;
    assert!(sphere.fit_chains(&train)?);
    let mut evidence = Evidence::new(test.nchains(), &sphere, EvidenceSettings::default())?;
    evidence.add_chains(&test)?;
    let summary = evidence.finalize()?;
    assert!((summary.ln_evidence_inv + problem.ln_evidence()).abs() < 0.05);
    Ok(())
}

#[test]
fn cross_validation_survives_failing_configuration() -> Result<()> {
    let chains = problem().chains(8, 50, 4)?;
    let hyper_parameters = [1, 1000].map(|ngaussians| {
        HyperParameters::ModifiedGaussianMixture(MixtureHyperParameters {
            ngaussians,
            ..Default::default()
        })
    });
    let grid = cross_validation(
        &chains,
        &[Domain::new(0.1, 1.)?],
        &hyper_parameters,
        ModelFamily::ModifiedGaussianMixture,
        &CrossValidationSettings::default(),
    )?;
    let variances = grid.ln_variances();
    assert!(variances[0].is_finite());
    assert_eq!(variances[1], f64::INFINITY);
    assert_eq!(
        grid.best().map(|entry| entry.hyper_parameters),
        Some(hyper_parameters[0])
    );
    Ok(())
}

#[test]
fn fit_rejects_wrong_dimension() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let normal = Normal::new(0., 1.)?;
    let samples: Vec<f64> = (0..300).map(|_| normal.sample(&mut rng)).collect();
    let ln_posterior = vec![0.; 100];

    for family in [
        ModelFamily::HyperSphere,
        ModelFamily::ModifiedGaussianMixture,
        ModelFamily::KernelDensity,
    ] {
        let hyper_parameters = match family {
            ModelFamily::HyperSphere => HyperParameters::HyperSphere,
            ModelFamily::ModifiedGaussianMixture => {
                HyperParameters::ModifiedGaussianMixture(Default::default())
            }
            ModelFamily::KernelDensity => HyperParameters::KernelDensity(Default::default()),
        };
        let mut model = family.build(2, Domain::default(), &hyper_parameters)?;
        assert_eq!(
            model.fit(&samples, &ln_posterior),
            Err(HarmonicError::DimensionMismatch {
                expected: 2,
                found: 3
            })
        );
        assert!(!model.is_fitted());
    }
    Ok(())
}

#[test]
fn four_chains_split_in_half() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(6);
    let normal = Normal::new(0., 1.)?;
    let samples: Vec<f64> = (0..4 * 100 * 2).map(|_| normal.sample(&mut rng)).collect();
    let ln_posterior: Vec<f64> = samples
        .chunks_exact(2)
        .map(|x| -0.5 * (x[0] * x[0] + x[1] * x[1]))
        .collect();
    let mut chains = Chains::new(2)?;
    chains.add_chains_2d(&samples, &ln_posterior, 4)?;

    let (train, test) = split_data(&chains, 0.5, 0)?;
    assert_eq!((train.nchains(), test.nchains()), (2, 2));
    assert_eq!(train.nsamples_per_chain(), vec![100, 100]);
    assert_eq!(split_data(&chains, 0.5, 0)?, (train, test));
    Ok(())
}
