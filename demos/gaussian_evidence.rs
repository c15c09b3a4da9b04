//! Evidence of a correlated Gaussian posterior from independent draws.
//!
//! Run with `RUST_LOG=debug` to follow the cross-validation.

use anyhow::Result;
use faer::{linalg::solvers::DenseSolveCore, Col, ColRef, Mat, Side};
use harmonic_evidence::{
    estimate_evidence, Candidate, Chains, Domain, HyperParameters, KernelDensityHyperParameters,
    MixtureHyperParameters, ModelFamily, PipelineSettings,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing_subscriber::EnvFilter;

const NDIM: usize = 4;
const NCHAINS: usize = 40;
const NSAMPLES: usize = 2000;

/// Unnormalised Gaussian with unit variances and correlation `rho` between
/// neighbouring coordinates, sampled through its Cholesky factor.
struct Posterior {
    chol: Mat<f64>,
    inv_cov: Mat<f64>,
    ln_det_cov: f64,
}

impl Posterior {
    fn new(rho: f64) -> Result<Self> {
        let cov = Mat::from_fn(NDIM, NDIM, |i, j| match i.abs_diff(j) {
            0 => 1.,
            1 => rho,
            _ => 0.,
        });
        let llt = cov.llt(Side::Lower)?;
        let chol = llt.L().to_owned();
        let ln_det_cov = 2. * (0..NDIM).map(|i| chol[(i, i)].ln()).sum::<f64>();
        Ok(Self {
            inv_cov: llt.inverse(),
            chol,
            ln_det_cov,
        })
    }

    fn ln_posterior(&self, x: &[f64]) -> f64 {
        let precision_x = &self.inv_cov * ColRef::from_slice(x);
        -0.5 * x
            .iter()
            .zip(precision_x.try_as_col_major().unwrap().as_slice())
            .map(|(a, b)| a * b)
            .sum::<f64>()
    }

    fn ln_evidence(&self) -> f64 {
        0.5 * NDIM as f64 * (2. * std::f64::consts::PI).ln() + 0.5 * self.ln_det_cov
    }

    fn draw(&self, rng: &mut ChaCha8Rng) -> Col<f64> {
        let z: Col<f64> = Col::from_fn(NDIM, |_| StandardNormal.sample(&mut *rng));
        &self.chol * &z
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let posterior = Posterior::new(0.5)?;
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut chains = Chains::new(NDIM)?;
    for _ in 0..NCHAINS {
        let mut samples = Vec::with_capacity(NSAMPLES * NDIM);
        let mut ln_posterior = Vec::with_capacity(NSAMPLES);
        for _ in 0..NSAMPLES {
            let x = posterior.draw(&mut rng);
            ln_posterior.push(posterior.ln_posterior(x.try_as_col_major().unwrap().as_slice()));
            samples.extend_from_slice(x.try_as_col_major().unwrap().as_slice());
        }
        chains.add_chain(&samples, &ln_posterior)?;
    }

    let mixture = [1, 2, 3].map(|ngaussians| {
        HyperParameters::ModifiedGaussianMixture(MixtureHyperParameters {
            ngaussians,
            ..Default::default()
        })
    });
    let candidates = [
        Candidate::hyper_sphere(vec![Domain::new(0.1, 3.)?]),
        Candidate::new(
            ModelFamily::ModifiedGaussianMixture,
            vec![Domain::new(0.1, 0.5)?, Domain::new(0.1, 1.)?],
            mixture.to_vec(),
        ),
        Candidate::new(
            ModelFamily::KernelDensity,
            vec![Domain::default()],
            [0.2, 0.5]
                .map(|radius| {
                    HyperParameters::KernelDensity(KernelDensityHyperParameters { radius })
                })
                .to_vec(),
        ),
    ];

    let run = estimate_evidence(&chains, &candidates, &PipelineSettings::default())?;
    for grid in run.selection.grids.iter() {
        println!("{:?}: {:?}", grid.family(), grid.ln_variances());
    }
    println!(
        "selected {:?} with {:?} (fit converged: {})",
        run.selection.family, run.selection.hyper_parameters, run.fit_success
    );

    let (ln_z, ln_z_std) = run.summary.compute_ln_evidence();
    println!("ln z = {:.4} (std ln z ~ {:.2e})", ln_z, (ln_z_std - ln_z).exp());
    println!("analytic ln z = {:.4}", posterior.ln_evidence());
    println!("{:#?}", run.summary.diagnostics());
    Ok(())
}
