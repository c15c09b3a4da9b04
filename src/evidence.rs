//! The learnt harmonic mean estimator of the inverse evidence.
//!
//! For posterior samples `x ~ P` and a normalised model density `φ`,
//! `ρ = E_P[φ(x) / (L(x) π(x))]` equals the inverse evidence `1 / z`. Terms
//! are accumulated per chain in log space by [`Evidence::add_chains`], the
//! chain means are then combined in [`Evidence::finalize`] into the estimate
//! and the variance of the estimate.

use std::borrow::Cow;

use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, debug_span, warn};

use crate::{
    accumulator::{Extrema, TermAccumulator},
    chains::{ChainRef, Chains},
    error::{HarmonicError, Result},
    math::logaddexp,
    model::DensityModel,
};

/// How the exponent of the terms is shifted before leaving log space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ShiftStrategy {
    /// Shift by the largest `lnarg`, so no term exceeds one.
    #[default]
    Max,
    /// Shift by the mean of the finite `lnarg` values.
    Mean,
    /// Shift by the smallest `lnarg`.
    Min,
    /// Terms are `exp(lnarg + v)`.
    Fixed(f64),
    /// Terms are `exp(lnarg)`.
    Disabled,
}

/// What to do with samples the model or the posterior cannot evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfDomainPolicy {
    /// Fail the whole `add_chains` call.
    Reject,
    /// Leave the sample out and count it.
    #[default]
    Drop,
}

impl OutOfDomainPolicy {
    /// Apply the policy to the non-finite samples of training chains.
    ///
    /// Borrows `chains` if all samples are finite.
    pub(crate) fn apply_to_training(self, chains: &Chains) -> Result<Cow<'_, Chains>> {
        if chains.is_finite() {
            return Ok(Cow::Borrowed(chains));
        }
        match self {
            OutOfDomainPolicy::Reject => Err(HarmonicError::OutOfDomain(
                "training chains hold non-finite samples".into(),
            )),
            OutOfDomainPolicy::Drop => {
                let (finite, ndropped) = chains.retain_finite();
                warn!(
                    ndropped,
                    nsamples = chains.nsamples(),
                    nchains = finite.nchains(),
                    "dropped non-finite training samples"
                );
                Ok(Cow::Owned(finite))
            }
        }
    }
}

/// Settings of the evidence estimator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvidenceSettings {
    pub shift: ShiftStrategy,
    pub out_of_domain: OutOfDomainPolicy,
}

/// Accumulates harmonic mean terms of a fixed number of chains.
///
/// The model is borrowed for the lifetime of the estimator and only
/// evaluated, never refitted.
pub struct Evidence<'m, M: DensityModel + ?Sized> {
    model: &'m M,
    settings: EvidenceSettings,
    chains: Vec<TermAccumulator>,
}

impl<'m, M: DensityModel + ?Sized> Evidence<'m, M> {
    pub fn new(nchains: usize, model: &'m M, settings: EvidenceSettings) -> Result<Self> {
        if !model.is_fitted() {
            return Err(HarmonicError::NotFitted);
        }
        if nchains == 0 {
            return Err(HarmonicError::InsufficientChains {
                required: 2,
                available: 0,
            });
        }
        Ok(Self {
            model,
            settings,
            chains: vec![TermAccumulator::new(); nchains],
        })
    }

    pub fn nchains(&self) -> usize {
        self.chains.len()
    }

    pub fn settings(&self) -> &EvidenceSettings {
        &self.settings
    }

    pub fn model(&self) -> &'m M {
        self.model
    }

    /// Running state of every chain.
    pub fn accumulators(&self) -> &[TermAccumulator] {
        &self.chains
    }

    /// Number of samples dropped as out of domain so far.
    pub fn ndropped(&self) -> u64 {
        self.chains.iter().map(|c| c.ndropped()).sum()
    }

    fn accumulate_chain(&self, chain: ChainRef<'_>) -> Result<TermAccumulator> {
        let mut acc = TermAccumulator::new();
        for (position, ln_posterior) in chain.iter() {
            let valid_input = ln_posterior.is_finite() && position.iter().all(|x| x.is_finite());
            let ln_predict = if valid_input {
                match self.model.predict(position) {
                    Ok(value) if !value.is_nan() => Ok(value),
                    Ok(_) => Err(HarmonicError::OutOfDomain(format!(
                        "model density is NaN at {:?}",
                        position
                    ))),
                    Err(err @ HarmonicError::OutOfDomain(_)) => Err(err),
                    Err(err) => return Err(err),
                }
            } else {
                Err(HarmonicError::OutOfDomain(format!(
                    "non-finite sample {:?} with ln posterior {}",
                    position, ln_posterior
                )))
            };

            match (ln_predict, self.settings.out_of_domain) {
                (Ok(ln_predict), _) => acc.add_sample(ln_predict, ln_posterior),
                (Err(err), OutOfDomainPolicy::Reject) => return Err(err),
                (Err(_), OutOfDomainPolicy::Drop) => acc.add_dropped(),
            }
        }
        Ok(acc)
    }

    /// Add the samples of `chains`, chain `i` extending the sums of chain `i`.
    ///
    /// Either all chains are added or, on error, none.
    pub fn add_chains(&mut self, chains: &Chains) -> Result<()> {
        if chains.ndim() != self.model.ndim() {
            return Err(HarmonicError::DimensionMismatch {
                expected: self.model.ndim(),
                found: chains.ndim(),
            });
        }
        if chains.nchains() != self.nchains() {
            return Err(HarmonicError::ChainCountMismatch {
                expected: self.nchains(),
                found: chains.nchains(),
            });
        }
        let _span = debug_span!("add_chains", nchains = chains.nchains()).entered();

        let this = &*self;
        let partial: Vec<TermAccumulator> = (0..chains.nchains())
            .into_par_iter()
            .map(|i| this.accumulate_chain(chains.chain(i)))
            .collect::<Result<_>>()?;

        let ndropped: u64 = partial.iter().map(|acc| acc.ndropped()).sum();
        if ndropped > 0 {
            warn!(
                ndropped,
                nsamples = chains.nsamples(),
                "dropped out-of-domain samples"
            );
        }
        self.chains
            .iter_mut()
            .zip(partial.iter())
            .for_each(|(acc, new)| acc.merge(new));
        debug!(nsamples = chains.nsamples(), "accumulated chains");
        Ok(())
    }

    /// Combine with an estimator over other samples of the same chains.
    pub fn merge(&mut self, other: &Evidence<'_, M>) -> Result<()> {
        if other.nchains() != self.nchains() {
            return Err(HarmonicError::ChainCountMismatch {
                expected: self.nchains(),
                found: other.nchains(),
            });
        }
        self.chains
            .iter_mut()
            .zip(other.chains.iter())
            .for_each(|(acc, new)| acc.merge(new));
        Ok(())
    }

    fn shift_value(&self) -> f64 {
        let extreme = |max: bool| {
            let pick: fn(f64, f64) -> f64 = if max { f64::max } else { f64::min };
            self.chains
                .iter()
                .filter(|acc| !acc.lnarg().is_empty())
                .map(|acc| if max { acc.lnarg().max } else { acc.lnarg().min })
                .reduce(pick)
        };
        match self.settings.shift {
            ShiftStrategy::Max => extreme(true).map_or(0., |v| -v),
            ShiftStrategy::Min => extreme(false).map_or(0., |v| -v),
            ShiftStrategy::Mean => {
                let (sum, count) = self
                    .chains
                    .iter()
                    .map(|acc| acc.finite_lnargs())
                    .fold((0., 0), |(s, n), (ds, dn)| (s + ds, n + dn));
                if count == 0 {
                    0.
                } else {
                    -sum / count as f64
                }
            }
            ShiftStrategy::Fixed(value) => value,
            ShiftStrategy::Disabled => 0.,
        }
    }

    /// Combine the chains into the final estimate.
    pub fn finalize(self) -> Result<EvidenceSummary> {
        let used = self.chains.iter().filter(|acc| acc.nsamples() > 0).collect_vec();
        if used.len() < 2 {
            return Err(HarmonicError::InsufficientChains {
                required: 2,
                available: used.len(),
            });
        }
        let shift = self.shift_value();

        let counts = used.iter().map(|acc| acc.nsamples() as f64).collect_vec();
        let total: f64 = counts.iter().sum();
        let total_sq: f64 = counts.iter().map(|n| n * n).sum();
        let n_eff = total * total / total_sq;

        let chain_means = used
            .iter()
            .zip(counts.iter())
            .map(|(acc, n)| (acc.ln_sum() + shift - n.ln()).exp())
            .collect_vec();
        let evidence_inv = chain_means
            .iter()
            .zip(counts.iter())
            .map(|(y, n)| n * y)
            .sum::<f64>()
            / total;
        if !(evidence_inv.is_finite() && evidence_inv > 0.) {
            return Err(HarmonicError::DegenerateEstimate(format!(
                "inverse evidence {} with shift {}",
                evidence_inv, shift
            )));
        }

        let central_moment = |power: i32| {
            chain_means
                .iter()
                .zip(counts.iter())
                .map(|(y, n)| n * (y - evidence_inv).powi(power))
                .sum::<f64>()
                / total
        };
        let m2 = central_moment(2);
        let m4 = central_moment(4);
        let var = m2 / (n_eff - 1.);
        // Identical chain means leave no spread: take the smallest kurtosis,
        // so the variance of the variance vanishes with the variance
        let kurtosis = if m2 > 0. { m4 / (m2 * m2) } else { 1. };
        let var_var = var * var / n_eff * ((kurtosis - 1.) + 2. / (n_eff - 1.));

        let extrema = |get: fn(&TermAccumulator) -> &Extrema| {
            let mut all = Extrema::default();
            self.chains.iter().for_each(|acc| all.merge(get(acc)));
            all
        };
        let lnarg = extrema(TermAccumulator::lnarg);
        let lnprob = extrema(TermAccumulator::ln_posterior);
        let lnpredict = extrema(TermAccumulator::ln_predict);

        let summary = EvidenceSummary {
            nchains: self.chains.len(),
            ln_evidence_inv: evidence_inv.ln() - shift,
            ln_evidence_inv_var: var.ln() - 2. * shift,
            ln_evidence_inv_var_var: var_var.ln() - 4. * shift,
            ln_kurtosis: kurtosis.ln(),
            n_eff,
            shift: self.settings.shift,
            shift_value: shift,
            running_sum: self
                .chains
                .iter()
                .map(|acc| (acc.ln_sum() + shift).exp())
                .collect(),
            nsamples_per_chain: self.chains.iter().map(|acc| acc.nsamples()).collect(),
            nsamples_eff_per_chain: self
                .chains
                .iter()
                .map(|acc| acc.effective_nsamples())
                .collect(),
            ndropped_per_chain: self.chains.iter().map(|acc| acc.ndropped()).collect(),
            lnargmax: lnarg.max,
            lnargmin: lnarg.min,
            lnprobmax: lnprob.max,
            lnprobmin: lnprob.min,
            lnpredictmax: lnpredict.max,
            lnpredictmin: lnpredict.min,
        };
        debug!(
            ln_evidence_inv = summary.ln_evidence_inv,
            ln_evidence_inv_var = summary.ln_evidence_inv_var,
            n_eff,
            "finalized evidence"
        );
        Ok(summary)
    }
}

/// Final statistics of the inverse evidence estimate.
///
/// All `ln_*` values have the shift removed, so they do not depend on the
/// shift strategy. `running_sum` is kept in shifted real space.
///
/// If all chain means are equal, `ln_evidence_inv_var` and
/// `ln_evidence_inv_var_var` are `-inf` and `ln_kurtosis` is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceSummary {
    pub nchains: usize,
    pub ln_evidence_inv: f64,
    pub ln_evidence_inv_var: f64,
    pub ln_evidence_inv_var_var: f64,
    pub ln_kurtosis: f64,
    /// Effective number of chains `(Σ n)² / Σ n²`.
    pub n_eff: f64,
    pub shift: ShiftStrategy,
    pub shift_value: f64,
    pub running_sum: Vec<f64>,
    pub nsamples_per_chain: Vec<u64>,
    pub nsamples_eff_per_chain: Vec<f64>,
    pub ndropped_per_chain: Vec<u64>,
    pub lnargmax: f64,
    pub lnargmin: f64,
    pub lnprobmax: f64,
    pub lnprobmin: f64,
    pub lnpredictmax: f64,
    pub lnpredictmin: f64,
}

/// Basic health indicators of an estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub mean_nsamples_eff_per_chain: f64,
    /// `lnargmax - lnargmin`.
    pub lnarg_range: f64,
    pub kurtosis: f64,
    /// `sqrt(2 / (n_eff - 1))`, the scale of the kurtosis correction.
    pub kurtosis_bound: f64,
    /// Relative standard deviation of the variance estimate.
    pub var_relative_std: f64,
}

const MIN_MEAN_ESS: f64 = 30.;
const MAX_LNARG_RANGE: f64 = 400.;
const MAX_VAR_RELATIVE_STD: f64 = 0.5;

impl EvidenceSummary {
    pub fn evidence_inv(&self) -> f64 {
        self.ln_evidence_inv.exp()
    }

    pub fn evidence_inv_var(&self) -> f64 {
        self.ln_evidence_inv_var.exp()
    }

    pub fn evidence_inv_var_var(&self) -> f64 {
        self.ln_evidence_inv_var_var.exp()
    }

    pub fn ln_evidence(&self) -> f64 {
        -self.ln_evidence_inv
    }

    /// `(ln z, ln σ_z)`, with `σ_z ≈ σ_ρ / ρ²` to first order.
    pub fn compute_ln_evidence(&self) -> (f64, f64) {
        let ln_std = 0.5 * self.ln_evidence_inv_var - 2. * self.ln_evidence_inv;
        (self.ln_evidence(), ln_std)
    }

    /// `(z, σ_z)` in real space. May overflow for large evidences.
    pub fn compute_evidence(&self) -> (f64, f64) {
        let (ln_z, ln_std) = self.compute_ln_evidence();
        (ln_z.exp(), ln_std.exp())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let ess = &self.nsamples_eff_per_chain;
        Diagnostics {
            mean_nsamples_eff_per_chain: ess.iter().sum::<f64>() / ess.len().max(1) as f64,
            lnarg_range: self.lnargmax - self.lnargmin,
            kurtosis: self.ln_kurtosis.exp(),
            kurtosis_bound: (2. / (self.n_eff - 1.)).sqrt(),
            var_relative_std: if self.ln_evidence_inv_var == f64::NEG_INFINITY {
                0.
            } else {
                (0.5 * self.ln_evidence_inv_var_var - self.ln_evidence_inv_var).exp()
            },
        }
    }

    /// Log warnings for estimates that are likely unreliable.
    ///
    /// Returns true if no check fired.
    pub fn check_basic_diagnostic(&self) -> bool {
        let diag = self.diagnostics();
        let mut ok = true;
        if diag.mean_nsamples_eff_per_chain < MIN_MEAN_ESS {
            warn!(
                mean_ess = diag.mean_nsamples_eff_per_chain,
                "few effective samples per chain, the model may be too wide"
            );
            ok = false;
        }
        if diag.lnarg_range > MAX_LNARG_RANGE {
            warn!(
                lnarg_range = diag.lnarg_range,
                "harmonic mean terms span a very large range"
            );
            ok = false;
        }
        if !(diag.var_relative_std <= MAX_VAR_RELATIVE_STD) {
            warn!(
                var_relative_std = diag.var_relative_std,
                "variance of the estimate is poorly determined"
            );
            ok = false;
        }
        ok
    }
}

/// `(ln BF₁₂, ln σ_BF)` for the Bayes factor `z₁ / z₂`.
///
/// Relative variances of the two estimates are added.
pub fn compute_ln_bayes_factor(ev1: &EvidenceSummary, ev2: &EvidenceSummary) -> (f64, f64) {
    let ln_bf = ev2.ln_evidence_inv - ev1.ln_evidence_inv;
    let ln_rel_var = logaddexp(
        ev1.ln_evidence_inv_var - 2. * ev1.ln_evidence_inv,
        ev2.ln_evidence_inv_var - 2. * ev2.ln_evidence_inv,
    );
    (ln_bf, ln_bf + 0.5 * ln_rel_var)
}

/// `(BF₁₂, σ_BF)` in real space.
pub fn compute_bayes_factor(ev1: &EvidenceSummary, ev2: &EvidenceSummary) -> (f64, f64) {
    let (ln_bf, ln_std) = compute_ln_bayes_factor(ev1, ev2);
    (ln_bf.exp(), ln_std.exp())
}
