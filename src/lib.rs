//! Estimate the Bayesian evidence from posterior samples with the learnt
//! harmonic mean estimator.
//!
//! The estimator needs samples from the posterior, grouped in chains, and
//! the unnormalised log posterior at every sample. A density model with
//! lighter tails than the posterior is fitted to a training part of the
//! chains, and the harmonic mean of the posterior re-weighted by the model
//! on the remaining chains estimates the inverse evidence.
//!
//! ```no_run
//! use harmonic_evidence::{
//!     estimate_evidence, Candidate, Chains, Domain, HyperParameters,
//!     MixtureHyperParameters, ModelFamily, PipelineSettings,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut chains = Chains::new(2)?;
//! # let (samples, ln_posterior) = (vec![0f64; 2000], vec![0f64; 1000]);
//! chains.add_chains_2d(&samples, &ln_posterior, 10)?;
//!
//! let candidates = [
//!     Candidate::hyper_sphere(vec![Domain::new(0.1, 2.)?]),
//!     Candidate::new(
//!         ModelFamily::ModifiedGaussianMixture,
//!         vec![Domain::new(0.1, 1.)?],
//!         vec![HyperParameters::ModifiedGaussianMixture(
//!             MixtureHyperParameters::default(),
//!         )],
//!     ),
//! ];
//! let run = estimate_evidence(&chains, &candidates, &PipelineSettings::default())?;
//! let (ln_z, ln_z_std) = run.summary.compute_ln_evidence();
//! println!("ln z = {ln_z}, ln std(z) = {ln_z_std}");
//! # Ok(())
//! # }
//! ```

pub(crate) mod accumulator;
pub(crate) mod chains;
pub(crate) mod cross_validation;
pub(crate) mod error;
pub(crate) mod evidence;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod partition;
pub(crate) mod selection;

pub use accumulator::{Extrema, TermAccumulator};
pub use chains::{ChainRef, Chains};
pub use cross_validation::{
    cross_validation, CrossValidationSettings, ValidationEntry, ValidationGrid,
};
pub use error::{HarmonicError, Result};
pub use evidence::{
    compute_bayes_factor, compute_ln_bayes_factor, Diagnostics, Evidence, EvidenceSettings,
    EvidenceSummary, OutOfDomainPolicy, ShiftStrategy,
};
pub use model::{
    DensityModel, Domain, HyperParameters, HyperSphere, KernelDensityEstimate,
    KernelDensityHyperParameters, MixtureHyperParameters, ModelFamily,
    ModifiedGaussianMixtureModel,
};
pub use partition::{fold, fold_with_rng, split_data, split_data_with_rng, Fold};
pub use selection::{
    estimate_evidence, select_model, Candidate, EvidenceRun, PipelineSettings, Selection,
};
