//! Model selection across families and the end-to-end evidence pipeline.

use tracing::{info, info_span, warn};

use crate::{
    chains::Chains,
    cross_validation::{cross_validation, CrossValidationSettings, ValidationGrid},
    error::{HarmonicError, Result},
    evidence::{Evidence, EvidenceSettings, EvidenceSummary},
    model::{DensityModel, Domain, HyperParameters, ModelFamily},
    partition::split_data,
};

/// A model family together with the grid it is validated on.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub family: ModelFamily,
    pub domains: Vec<Domain>,
    pub hyper_parameters: Vec<HyperParameters>,
}

impl Candidate {
    pub fn new(
        family: ModelFamily,
        domains: Vec<Domain>,
        hyper_parameters: Vec<HyperParameters>,
    ) -> Self {
        Self {
            family,
            domains,
            hyper_parameters,
        }
    }

    /// Hyper-sphere candidate, which has no hyper-parameters to search.
    pub fn hyper_sphere(domains: Vec<Domain>) -> Self {
        Self::new(
            ModelFamily::HyperSphere,
            domains,
            vec![HyperParameters::HyperSphere],
        )
    }
}

/// The winning configuration and the grids it was chosen from.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub family: ModelFamily,
    pub domain: Domain,
    pub hyper_parameters: HyperParameters,
    pub ln_validation_variance: f64,
    /// One grid per candidate, in candidate order.
    pub grids: Vec<ValidationGrid>,
}

/// Cross-validate all candidates and pick the configuration with the lowest
/// validation variance.
///
/// Ties go to the configuration listed first. The winner is returned as is.
pub fn select_model(
    chains_train: &Chains,
    candidates: &[Candidate],
    settings: &CrossValidationSettings,
) -> Result<Selection> {
    if candidates.is_empty() {
        return Err(HarmonicError::Configuration(
            "no model candidates to select from".into(),
        ));
    }

    let grids = candidates
        .iter()
        .map(|candidate| {
            cross_validation(
                chains_train,
                &candidate.domains,
                &candidate.hyper_parameters,
                candidate.family,
                settings,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let best = grids
        .iter()
        .filter_map(|grid| grid.best().map(|entry| (grid.family(), entry)))
        .reduce(|best, next| {
            if next.1.ln_validation_variance < best.1.ln_validation_variance {
                next
            } else {
                best
            }
        });
    let (family, entry) = match best {
        Some((family, entry)) if entry.ln_validation_variance < f64::INFINITY => (family, entry),
        _ => {
            return Err(HarmonicError::DegenerateEstimate(
                "every candidate configuration failed cross-validation".into(),
            ))
        }
    };
    info!(
        ?family,
        hyper_parameters = ?entry.hyper_parameters,
        domain_min = entry.domain.min(),
        domain_max = entry.domain.max(),
        ln_validation_variance = entry.ln_validation_variance,
        "selected model"
    );
    let (domain, hyper_parameters, ln_validation_variance) = (
        entry.domain,
        entry.hyper_parameters,
        entry.ln_validation_variance,
    );

    Ok(Selection {
        family,
        domain,
        hyper_parameters,
        ln_validation_variance,
        grids,
    })
}

/// Settings of [`estimate_evidence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Fraction of chains used to select and fit the model.
    pub training_proportion: f64,
    /// Seed of the train/test split.
    pub seed: u64,
    pub cross_validation: CrossValidationSettings,
    /// Estimator settings on the test chains.
    pub evidence: EvidenceSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            training_proportion: 0.5,
            seed: 0,
            cross_validation: CrossValidationSettings::default(),
            evidence: EvidenceSettings::default(),
        }
    }
}

/// Output of [`estimate_evidence`].
pub struct EvidenceRun {
    pub selection: Selection,
    /// The selected model fitted on the training chains.
    pub model: Box<dyn DensityModel>,
    /// Whether the final fit converged. The summary is still computed if not.
    pub fit_success: bool,
    pub summary: EvidenceSummary,
}

/// Split, select, fit and estimate the evidence in one go.
///
/// Non-finite samples are dropped or rejected according to
/// `settings.evidence.out_of_domain`, in the training and the test chains.
pub fn estimate_evidence(
    chains: &Chains,
    candidates: &[Candidate],
    settings: &PipelineSettings,
) -> Result<EvidenceRun> {
    let _span = info_span!("estimate_evidence", nchains = chains.nchains()).entered();

    let (train, test) = split_data(chains, settings.training_proportion, settings.seed)?;
    info!(
        ntrain = train.nchains(),
        ntest = test.nchains(),
        "split chains into training and test set"
    );

    let train = settings.evidence.out_of_domain.apply_to_training(&train)?;

    let selection = select_model(&train, candidates, &settings.cross_validation)?;
    let mut model =
        selection
            .family
            .build(chains.ndim(), selection.domain, &selection.hyper_parameters)?;
    let fit_success = model.fit_chains(&train)?;
    if !fit_success {
        warn!(family = ?selection.family, "fit of the selected model did not converge");
    }

    let mut evidence = Evidence::new(test.nchains(), model.as_ref(), settings.evidence)?;
    evidence.add_chains(&test)?;
    let summary = evidence.finalize()?;
    summary.check_basic_diagnostic();
    let (ln_evidence, ln_evidence_std) = summary.compute_ln_evidence();
    info!(ln_evidence, ln_evidence_std, "estimated evidence");

    Ok(EvidenceRun {
        selection,
        model,
        fit_success,
        summary,
    })
}
