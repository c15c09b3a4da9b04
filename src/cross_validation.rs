//! k-fold cross-validation of density model configurations.
//!
//! Every `(domain, hyper-parameters)` pair of a grid is fitted on the
//! training chains of each fold and scored by the variance of the evidence
//! estimate on the held-out chains. A configuration that cannot be fitted or
//! evaluated scores `+inf` instead of aborting the search.

use itertools::{iproduct, Itertools};
use rayon::prelude::*;
use tracing::{debug, info_span};

use crate::{
    chains::Chains,
    error::{HarmonicError, Result},
    evidence::{Evidence, EvidenceSettings},
    math::logsumexp,
    model::{Domain, HyperParameters, ModelFamily},
    partition::{fold, Fold},
};

/// Settings of the cross-validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossValidationSettings {
    /// Number of folds, at least 2.
    pub nfold: usize,
    /// Seed of the chain shuffle that builds the folds.
    pub seed: u64,
    /// Estimator settings used on the validation chains.
    pub evidence: EvidenceSettings,
    /// Evaluate folds and grid entries on the rayon thread pool.
    pub parallel: bool,
}

impl Default for CrossValidationSettings {
    fn default() -> Self {
        Self {
            nfold: 2,
            seed: 0,
            evidence: EvidenceSettings::default(),
            parallel: true,
        }
    }
}

/// Validation result of one model configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationEntry {
    pub domain: Domain,
    pub hyper_parameters: HyperParameters,
    /// Log of the mean variance over the folds, `+inf` if any fold failed.
    pub ln_validation_variance: f64,
    pub fold_ln_variances: Vec<f64>,
}

/// Validation results of a whole grid, in domain-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationGrid {
    family: ModelFamily,
    entries: Vec<ValidationEntry>,
}

impl ValidationGrid {
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn entries(&self) -> &[ValidationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ln_variances(&self) -> Vec<f64> {
        self.entries
            .iter()
            .map(|entry| entry.ln_validation_variance)
            .collect()
    }

    /// The first entry with the smallest validation variance.
    pub fn best(&self) -> Option<&ValidationEntry> {
        self.entries.iter().reduce(|best, entry| {
            if entry.ln_validation_variance < best.ln_validation_variance {
                entry
            } else {
                best
            }
        })
    }
}

/// Fit a fresh model on the training chains of `fold` and return the log
/// variance of the evidence estimate on its validation chains.
fn validate_fold(
    family: ModelFamily,
    domain: Domain,
    hyper_parameters: &HyperParameters,
    fold: &Fold,
    settings: EvidenceSettings,
) -> Result<f64> {
    let mut model = family.build(fold.train.ndim(), domain, hyper_parameters)?;
    if !model.fit_chains(&fold.train)? {
        return Err(HarmonicError::FitDivergence(format!(
            "{:?} with {:?} on domain [{}, {}]",
            family,
            hyper_parameters,
            domain.min(),
            domain.max()
        )));
    }
    let mut evidence = Evidence::new(fold.validate.nchains(), model.as_ref(), settings)?;
    evidence.add_chains(&fold.validate)?;
    Ok(evidence.finalize()?.ln_evidence_inv_var)
}

/// Turn recoverable failures, NaN and `+inf` variances into `+inf`.
///
/// A variance of exactly zero (`-inf`) is kept.
fn score(result: Result<f64>, entry: usize, fold: usize) -> Result<f64> {
    match result {
        Ok(value) if value < f64::INFINITY => Ok(value),
        Ok(value) => {
            debug!(entry, fold, value, "non-finite validation variance");
            Ok(f64::INFINITY)
        }
        Err(err) if err.is_recoverable() => {
            debug!(entry, fold, error = %err, "validation fold failed");
            Ok(f64::INFINITY)
        }
        Err(err) => Err(err),
    }
}

/// Cross-validate every combination of `domains` and `hyper_parameters`.
///
/// Folds are drawn over whole chains of `chains_train`. Non-finite training
/// samples are handled by the out-of-domain policy of `settings.evidence`.
/// The result is the same whether or not the evaluation runs in parallel.
pub fn cross_validation(
    chains_train: &Chains,
    domains: &[Domain],
    hyper_parameters: &[HyperParameters],
    family: ModelFamily,
    settings: &CrossValidationSettings,
) -> Result<ValidationGrid> {
    if domains.is_empty() || hyper_parameters.is_empty() {
        return Err(HarmonicError::Configuration(
            "cross-validation grid is empty".into(),
        ));
    }
    if let Some(other) = hyper_parameters.iter().find(|hp| hp.family() != family) {
        return Err(HarmonicError::Configuration(format!(
            "hyper-parameters {:?} do not belong to {:?}",
            other, family
        )));
    }
    let chains_train = settings
        .evidence
        .out_of_domain
        .apply_to_training(chains_train)?;
    // The smallest validation group must hold two chains
    let required = 2 * settings.nfold;
    if settings.nfold >= 2 && chains_train.nchains() < required {
        return Err(HarmonicError::InsufficientChains {
            required,
            available: chains_train.nchains(),
        });
    }
    let folds = fold(&chains_train, settings.nfold, settings.seed)?;

    let grid = iproduct!(domains.iter().copied(), hyper_parameters.iter().copied()).collect_vec();
    let _span = info_span!(
        "cross_validation",
        ?family,
        nentries = grid.len(),
        nfold = settings.nfold
    )
    .entered();

    let jobs = iproduct!(0..grid.len(), 0..folds.len()).collect_vec();
    let run = |&(entry, k): &(usize, usize)| {
        let (domain, hp) = &grid[entry];
        score(
            validate_fold(family, *domain, hp, &folds[k], settings.evidence),
            entry,
            k,
        )
    };
    let fold_scores: Vec<f64> = if settings.parallel {
        jobs.par_iter().map(run).collect::<Result<_>>()?
    } else {
        jobs.iter().map(run).collect::<Result<_>>()?
    };

    let ln_nfold = (folds.len() as f64).ln();
    let entries = grid
        .into_iter()
        .zip(fold_scores.chunks_exact(folds.len()))
        .enumerate()
        .map(|(i, ((domain, hyper_parameters), scores))| {
            let ln_validation_variance = logsumexp(scores.iter().copied()) - ln_nfold;
            debug!(
                entry = i,
                domain_min = domain.min(),
                domain_max = domain.max(),
                ln_validation_variance,
                "validated grid entry"
            );
            ValidationEntry {
                domain,
                hyper_parameters,
                ln_validation_variance,
                fold_ln_variances: scores.to_vec(),
            }
        })
        .collect();

    Ok(ValidationGrid { family, entries })
}
