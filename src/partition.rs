//! Chain-level partitions of a [`Chains`] collection.
//!
//! Both the train/test split and the cross-validation folds assign whole
//! chains, never individual samples, so a density model is never evaluated
//! on the chain it was fitted to.

use itertools::Itertools;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    chains::Chains,
    error::{HarmonicError, Result},
};

/// One cross-validation fold.
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub train: Chains,
    pub validate: Chains,
}

fn shuffled_indices<R: Rng + ?Sized>(nchains: usize, rng: &mut R) -> Vec<usize> {
    let mut indices = (0..nchains).collect_vec();
    indices.shuffle(rng);
    indices
}

/// Split chains into training and test collections.
///
/// `round(training_proportion * nchains)` randomly chosen chains end up in the
/// training set. Both halves keep the original chain order.
pub fn split_data_with_rng<R: Rng + ?Sized>(
    chains: &Chains,
    training_proportion: f64,
    rng: &mut R,
) -> Result<(Chains, Chains)> {
    let nchains = chains.nchains();
    let invalid = |ntrain: usize| HarmonicError::InvalidProportion {
        proportion: training_proportion,
        nchains,
        ntrain,
        ntest: nchains - ntrain,
    };

    if !(0f64..=1f64).contains(&training_proportion) {
        return Err(invalid(0));
    }
    let ntrain = (training_proportion * nchains as f64).round() as usize;
    if ntrain == 0 || ntrain == nchains {
        return Err(invalid(ntrain));
    }

    let indices = shuffled_indices(nchains, rng);
    let (train, test) = indices.split_at(ntrain);
    let train = train.iter().copied().sorted().collect_vec();
    let test = test.iter().copied().sorted().collect_vec();

    Ok((chains.sub_chains(&train)?, chains.sub_chains(&test)?))
}

/// Split chains into training and test collections, seeded.
///
/// The same seed and input always give the same partition.
pub fn split_data(
    chains: &Chains,
    training_proportion: f64,
    seed: u64,
) -> Result<(Chains, Chains)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    split_data_with_rng(chains, training_proportion, &mut rng)
}

/// Build `nfold` cross-validation folds over whole chains.
///
/// Chains are shuffled and cut into `nfold` groups whose sizes differ by at
/// most one. Fold `i` validates on group `i` and trains on all other groups.
pub fn fold_with_rng<R: Rng + ?Sized>(
    chains: &Chains,
    nfold: usize,
    rng: &mut R,
) -> Result<Vec<Fold>> {
    if nfold < 2 {
        return Err(HarmonicError::Configuration(format!(
            "cross-validation needs at least 2 folds, got {}",
            nfold
        )));
    }
    let nchains = chains.nchains();
    if nfold > nchains {
        return Err(HarmonicError::InsufficientChains {
            required: nfold,
            available: nchains,
        });
    }

    let indices = shuffled_indices(nchains, rng);
    let base = nchains / nfold;
    let extra = nchains % nfold;

    let mut groups = Vec::with_capacity(nfold);
    let mut start = 0;
    for i in 0..nfold {
        let len = base + usize::from(i < extra);
        groups.push(&indices[start..start + len]);
        start += len;
    }

    groups
        .iter()
        .enumerate()
        .map(|(i, validate)| {
            let train = groups
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .flat_map(|(_, group)| group.iter().copied())
                .sorted()
                .collect_vec();
            let validate = validate.iter().copied().sorted().collect_vec();
            Ok(Fold {
                train: chains.sub_chains(&train)?,
                validate: chains.sub_chains(&validate)?,
            })
        })
        .collect()
}

/// Build `nfold` cross-validation folds over whole chains, seeded.
pub fn fold(chains: &Chains, nfold: usize, seed: u64) -> Result<Vec<Fold>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    fold_with_rng(chains, nfold, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Chains whose first coordinate encodes `(chain, sample)` uniquely.
    fn labelled_chains(nchains: usize, nsamples: usize, ndim: usize) -> Chains {
        let mut chains = Chains::new(ndim).unwrap();
        for c in 0..nchains {
            let samples = (0..nsamples * ndim)
                .map(|k| (c * 1000 + k / ndim) as f64)
                .collect_vec();
            let ln_posterior = (0..nsamples).map(|s| -((c * 1000 + s) as f64)).collect_vec();
            chains.add_chain(&samples, &ln_posterior).unwrap();
        }
        chains
    }

    fn labels(chains: &Chains) -> Vec<u64> {
        chains
            .ln_posterior()
            .iter()
            .map(|&x| (-x) as u64)
            .sorted()
            .collect()
    }

    #[test]
    fn four_chains_half_split() {
        let chains = labelled_chains(4, 100, 2);
        let (train, test) = split_data(&chains, 0.5, 0).unwrap();
        assert_eq!(train.nchains(), 2);
        assert_eq!(test.nchains(), 2);
        assert_eq!(train.nsamples(), 200);

        let (train2, test2) = split_data(&chains, 0.5, 0).unwrap();
        assert_eq!(train, train2);
        assert_eq!(test, test2);
    }

    #[test]
    fn invalid_proportions() {
        let chains = labelled_chains(4, 3, 1);
        for proportion in [0., 0.1, 0.9, 1., -0.5, 1.5, f64::NAN] {
            let err = split_data(&chains, proportion, 1).unwrap_err();
            assert!(matches!(err, HarmonicError::InvalidProportion { .. }));
        }
    }

    #[test]
    fn fold_errors() {
        let chains = labelled_chains(3, 2, 1);
        assert_eq!(
            fold(&chains, 4, 0).unwrap_err(),
            HarmonicError::InsufficientChains {
                required: 4,
                available: 3
            }
        );
        assert!(matches!(
            fold(&chains, 1, 0).unwrap_err(),
            HarmonicError::Configuration(_)
        ));
    }

    proptest! {
        #[test]
        fn split_is_a_partition(
            nchains in 2usize..20,
            proportion in 0.05f64..0.95,
            seed in any::<u64>(),
        ) {
            let chains = labelled_chains(nchains, 3, 2);
            let ntrain = (proportion * nchains as f64).round() as usize;
            let result = split_data(&chains, proportion, seed);
            if ntrain == 0 || ntrain == nchains {
                prop_assert!(result.is_err());
            } else {
                let (train, test) = result.unwrap();
                prop_assert_eq!(train.nchains(), ntrain);
                let mut union = labels(&train);
                union.extend(labels(&test));
                union.sort();
                prop_assert_eq!(union, labels(&chains));
                prop_assert_eq!(split_data(&chains, proportion, seed).unwrap(), (train, test));
            }
        }

        #[test]
        fn folds_are_partitions(nchains in 2usize..25, nfold in 2usize..6, seed in any::<u64>()) {
            prop_assume!(nfold <= nchains);
            let chains = labelled_chains(nchains, 2, 1);
            let folds = fold(&chains, nfold, seed).unwrap();
            prop_assert_eq!(folds.len(), nfold);

            let mut validated = Vec::new();
            for f in folds.iter() {
                let mut union = labels(&f.train);
                union.extend(labels(&f.validate));
                union.sort();
                prop_assert_eq!(union, labels(&chains));
                let train = labels(&f.train);
                prop_assert!(labels(&f.validate).iter().all(|x| !train.contains(x)));
                let sizes = f.validate.nchains();
                prop_assert!(sizes == nchains / nfold || sizes == nchains / nfold + 1);
                validated.extend(labels(&f.validate));
            }
            validated.sort();
            prop_assert_eq!(validated, labels(&chains));
            prop_assert_eq!(fold(&chains, nfold, seed).unwrap(), folds);
        }
    }
}
