//! Storage for post burn-in MCMC chains.
//!
//! Samples of all chains are stored in one row-major buffer together with
//! their log posterior values. Chains are delimited by start offsets, so
//! sub-collections (train/test splits, folds, blocks) are cheap to build and
//! never share samples.

use itertools::Itertools;

use crate::error::{HarmonicError, Result};

/// Borrowed view of a single chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainRef<'a> {
    ndim: usize,
    samples: &'a [f64],
    ln_posterior: &'a [f64],
}

impl<'a> ChainRef<'a> {
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn nsamples(&self) -> usize {
        self.ln_posterior.len()
    }

    /// Row-major samples of this chain.
    pub fn samples(&self) -> &'a [f64] {
        self.samples
    }

    pub fn ln_posterior(&self) -> &'a [f64] {
        self.ln_posterior
    }

    /// Iterate over `(position, ln_posterior)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'a [f64], f64)> + 'a {
        self.samples
            .chunks_exact(self.ndim)
            .zip(self.ln_posterior.iter().copied())
    }
}

/// A collection of chains sharing the same dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Chains {
    ndim: usize,
    samples: Vec<f64>,
    ln_posterior: Vec<f64>,
    start_indices: Vec<usize>,
}

impl Chains {
    /// Empty collection of chains in `ndim` dimensions.
    pub fn new(ndim: usize) -> Result<Self> {
        if ndim == 0 {
            return Err(HarmonicError::Configuration(
                "chains need at least one dimension".into(),
            ));
        }
        Ok(Self::empty(ndim))
    }

    fn empty(ndim: usize) -> Self {
        Self {
            ndim,
            samples: Vec::new(),
            ln_posterior: Vec::new(),
            start_indices: vec![0],
        }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn nchains(&self) -> usize {
        self.start_indices.len() - 1
    }

    pub fn nsamples(&self) -> usize {
        self.ln_posterior.len()
    }

    pub fn nsamples_per_chain(&self) -> Vec<usize> {
        self.start_indices
            .iter()
            .tuple_windows()
            .map(|(start, end)| end - start)
            .collect()
    }

    /// Flattened row-major samples of all chains.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Log posterior values of all chains.
    pub fn ln_posterior(&self) -> &[f64] {
        &self.ln_posterior
    }

    /// Position of sample `i` of the flattened collection.
    pub fn sample(&self, i: usize) -> &[f64] {
        &self.samples[i * self.ndim..(i + 1) * self.ndim]
    }

    /// Start (inclusive) and end (exclusive) sample index of chain `i`.
    pub fn chain_indices(&self, i: usize) -> (usize, usize) {
        (self.start_indices[i], self.start_indices[i + 1])
    }

    pub fn chain(&self, i: usize) -> ChainRef<'_> {
        let (start, end) = self.chain_indices(i);
        ChainRef {
            ndim: self.ndim,
            samples: &self.samples[start * self.ndim..end * self.ndim],
            ln_posterior: &self.ln_posterior[start..end],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ChainRef<'_>> {
        (0..self.nchains()).map(|i| self.chain(i))
    }

    fn check_samples(&self, samples: &[f64], ln_posterior: &[f64]) -> Result<()> {
        if samples.len() != ln_posterior.len() * self.ndim {
            let found = if ln_posterior.is_empty() {
                samples.len()
            } else {
                samples.len() / ln_posterior.len()
            };
            return Err(HarmonicError::DimensionMismatch {
                expected: self.ndim,
                found,
            });
        }
        Ok(())
    }

    fn push_unchecked(&mut self, samples: &[f64], ln_posterior: &[f64]) {
        self.samples.extend_from_slice(samples);
        self.ln_posterior.extend_from_slice(ln_posterior);
        self.start_indices.push(self.ln_posterior.len());
    }

    /// Append a single chain given as row-major samples and their log posterior.
    pub fn add_chain(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<()> {
        if ln_posterior.is_empty() {
            return Err(HarmonicError::Configuration(
                "cannot add a chain without samples".into(),
            ));
        }
        self.check_samples(samples, ln_posterior)?;
        self.push_unchecked(samples, ln_posterior);
        Ok(())
    }

    /// Append `nchains` chains of equal length stored one after another.
    pub fn add_chains_2d(
        &mut self,
        samples: &[f64],
        ln_posterior: &[f64],
        nchains: usize,
    ) -> Result<()> {
        if nchains == 0 || ln_posterior.len() % nchains != 0 {
            return Err(HarmonicError::Configuration(format!(
                "{} samples cannot be divided into {} chains of equal length",
                ln_posterior.len(),
                nchains
            )));
        }
        self.check_samples(samples, ln_posterior)?;

        let nsamples = ln_posterior.len() / nchains;
        let starts = (0..=nchains).map(|i| i * nsamples).collect_vec();
        self.add_chains_2d_list(samples, ln_posterior, &starts)
    }

    /// Append chains of possibly different lengths.
    ///
    /// `start_indices` holds the first sample of every chain followed by the
    /// total number of samples, so chain `i` spans
    /// `start_indices[i]..start_indices[i + 1]`.
    pub fn add_chains_2d_list(
        &mut self,
        samples: &[f64],
        ln_posterior: &[f64],
        start_indices: &[usize],
    ) -> Result<()> {
        self.check_samples(samples, ln_posterior)?;
        let valid = start_indices.len() >= 2
            && start_indices[0] == 0
            && start_indices.last() == Some(&ln_posterior.len())
            && start_indices.iter().tuple_windows().all(|(a, b)| a < b);
        if !valid {
            return Err(HarmonicError::Configuration(format!(
                "invalid chain start indices {:?} for {} samples",
                start_indices,
                ln_posterior.len()
            )));
        }

        for (&start, &end) in start_indices.iter().tuple_windows() {
            self.push_unchecked(
                &samples[start * self.ndim..end * self.ndim],
                &ln_posterior[start..end],
            );
        }
        Ok(())
    }

    /// Append chains given as `chain -> sample -> coordinate` nested vectors.
    pub fn add_chains_3d(&mut self, samples: &[Vec<Vec<f64>>], ln_posterior: &[Vec<f64>]) -> Result<()> {
        if samples.len() != ln_posterior.len() {
            return Err(HarmonicError::ChainCountMismatch {
                expected: samples.len(),
                found: ln_posterior.len(),
            });
        }

        let mut staged = Chains::empty(self.ndim);
        for (chain, lnprob) in samples.iter().zip(ln_posterior) {
            if chain.len() != lnprob.len() {
                return Err(HarmonicError::Configuration(format!(
                    "chain holds {} samples but {} log posterior values",
                    chain.len(),
                    lnprob.len()
                )));
            }
            if let Some(bad) = chain.iter().find(|x| x.len() != self.ndim) {
                return Err(HarmonicError::DimensionMismatch {
                    expected: self.ndim,
                    found: bad.len(),
                });
            }
            let flat = chain.iter().flatten().copied().collect_vec();
            staged.add_chain(&flat, lnprob)?;
        }
        self.add(&staged)
    }

    /// Append all chains of another collection.
    pub fn add(&mut self, other: &Chains) -> Result<()> {
        if other.ndim != self.ndim {
            return Err(HarmonicError::DimensionMismatch {
                expected: self.ndim,
                found: other.ndim,
            });
        }
        for chain in other.iter() {
            self.push_unchecked(chain.samples(), chain.ln_posterior());
        }
        Ok(())
    }

    /// New collection holding copies of the chains at `indices`, in that order.
    pub fn sub_chains(&self, indices: &[usize]) -> Result<Chains> {
        let mut out = Chains::empty(self.ndim);
        for &i in indices {
            if i >= self.nchains() {
                return Err(HarmonicError::InsufficientChains {
                    required: i + 1,
                    available: self.nchains(),
                });
            }
            let chain = self.chain(i);
            out.push_unchecked(chain.samples(), chain.ln_posterior());
        }
        Ok(out)
    }

    /// Whether every coordinate and log posterior value is finite.
    pub fn is_finite(&self) -> bool {
        self.samples
            .iter()
            .chain(&self.ln_posterior)
            .all(|x| x.is_finite())
    }

    /// Copy without the samples that hold a non-finite coordinate or log
    /// posterior value, together with the number of samples left out.
    ///
    /// Chains left without samples are removed.
    pub fn retain_finite(&self) -> (Chains, usize) {
        let mut out = Chains::empty(self.ndim);
        let mut ndropped = 0;
        for chain in self.iter() {
            let mut samples = Vec::with_capacity(chain.samples().len());
            let mut ln_posterior = Vec::with_capacity(chain.nsamples());
            for (position, value) in chain.iter() {
                if value.is_finite() && position.iter().all(|x| x.is_finite()) {
                    samples.extend_from_slice(position);
                    ln_posterior.push(value);
                } else {
                    ndropped += 1;
                }
            }
            if !ln_posterior.is_empty() {
                out.push_unchecked(&samples, &ln_posterior);
            }
        }
        (out, ndropped)
    }

    /// Split chains into approximately `nblocks` blocks in total.
    ///
    /// Each chain is cut into a number of blocks proportional to its length
    /// (at least one per chain). Blocks keep the sample order of their chain.
    pub fn split_into_blocks(&self, nblocks: usize) -> Result<Chains> {
        if nblocks < self.nchains() {
            return Err(HarmonicError::Configuration(format!(
                "cannot split {} chains into fewer blocks ({})",
                self.nchains(),
                nblocks
            )));
        }

        let total = self.nsamples() as f64;
        let mut out = Chains::empty(self.ndim);
        for chain in self.iter() {
            let n = chain.nsamples();
            let nblocks_chain = ((n as f64 / total * nblocks as f64).round() as usize).clamp(1, n);
            let block_len = n / nblocks_chain;
            let mut start = 0;
            for block in 0..nblocks_chain {
                // The last block takes the remainder
                let end = if block + 1 == nblocks_chain {
                    n
                } else {
                    start + block_len
                };
                out.push_unchecked(
                    &chain.samples()[start * self.ndim..end * self.ndim],
                    &chain.ln_posterior()[start..end],
                );
                start = end;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toy_chains() -> Chains {
        let mut chains = Chains::new(2).unwrap();
        chains
            .add_chain(&[0., 1., 2., 3., 4., 5.], &[-1., -2., -3.])
            .unwrap();
        chains.add_chain(&[6., 7.], &[-4.]).unwrap();
        chains
    }

    #[test]
    fn add_and_index() {
        let chains = toy_chains();
        assert_eq!(chains.nchains(), 2);
        assert_eq!(chains.nsamples(), 4);
        assert_eq!(chains.nsamples_per_chain(), vec![3, 1]);
        assert_eq!(chains.chain_indices(1), (3, 4));
        assert_eq!(chains.sample(3), &[6., 7.]);
        assert_eq!(chains.chain(0).ln_posterior(), &[-1., -2., -3.]);

        let pairs = chains.chain(0).iter().collect_vec();
        assert_eq!(pairs[1], (&[2., 3.][..], -2.));
    }

    #[test]
    fn wrong_width_is_rejected() {
        let mut chains = Chains::new(2).unwrap();
        let err = chains.add_chain(&[0., 1., 2.], &[0.]).unwrap_err();
        assert_eq!(
            err,
            HarmonicError::DimensionMismatch {
                expected: 2,
                found: 3
            }
        );
        assert_eq!(chains.nchains(), 0);
        assert!(chains.add_chain(&[], &[]).is_err());
    }

    #[test]
    fn non_finite_samples_are_removed() {
        let mut chains = Chains::new(2).unwrap();
        chains
            .add_chain(&[0., 1., f64::NAN, 3., 4., 5.], &[-1., -2., -3.])
            .unwrap();
        chains.add_chain(&[6., 7.], &[f64::NEG_INFINITY]).unwrap();
        chains.add_chain(&[8., 9.], &[-5.]).unwrap();
        assert!(!chains.is_finite());

        let (finite, ndropped) = chains.retain_finite();
        assert_eq!(ndropped, 2);
        assert_eq!(finite.nsamples_per_chain(), vec![2, 1]);
        assert_eq!(finite.chain(0).samples(), &[0., 1., 4., 5.]);
        assert_eq!(finite.chain(0).ln_posterior(), &[-1., -3.]);
        assert!(finite.is_finite());
        assert_eq!(finite.retain_finite(), (finite.clone(), 0));
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(matches!(
            Chains::new(0),
            Err(HarmonicError::Configuration(_))
        ));
    }

    #[test]
    fn chains_2d() {
        let mut chains = Chains::new(1).unwrap();
        let samples = (0..12).map(|x| x as f64).collect_vec();
        chains.add_chains_2d(&samples, &samples, 3).unwrap();
        assert_eq!(chains.nsamples_per_chain(), vec![4, 4, 4]);
        assert_eq!(chains.chain(2).samples(), &[8., 9., 10., 11.]);
        assert!(chains.add_chains_2d(&samples, &samples, 5).is_err());

        let mut ragged = Chains::new(1).unwrap();
        ragged
            .add_chains_2d_list(&samples, &samples, &[0, 2, 7, 12])
            .unwrap();
        assert_eq!(ragged.nsamples_per_chain(), vec![2, 5, 5]);
        assert!(ragged
            .add_chains_2d_list(&samples, &samples, &[0, 7, 2, 12])
            .is_err());
    }

    #[test]
    fn chains_3d() {
        let samples = vec![
            vec![vec![0., 1.], vec![2., 3.]],
            vec![vec![4., 5.], vec![6., 7.]],
        ];
        let ln_posterior = vec![vec![-1., -2.], vec![-3., -4.]];
        let mut chains = Chains::new(2).unwrap();
        chains.add_chains_3d(&samples, &ln_posterior).unwrap();
        assert_eq!(chains.nchains(), 2);
        assert_eq!(chains.chain(1).samples(), &[4., 5., 6., 7.]);

        let bad = vec![vec![vec![0.]], vec![vec![1., 2.]]];
        let mut chains = Chains::new(2).unwrap();
        assert!(chains
            .add_chains_3d(&bad, &[vec![0.], vec![0.]])
            .is_err());
        assert_eq!(chains.nchains(), 0);
    }

    #[test]
    fn sub_chains_and_concatenation() {
        let chains = toy_chains();
        let sub = chains.sub_chains(&[1, 0]).unwrap();
        assert_eq!(sub.nsamples_per_chain(), vec![1, 3]);
        assert_eq!(sub.chain(0).samples(), &[6., 7.]);
        assert!(chains.sub_chains(&[2]).is_err());

        let mut joined = sub.clone();
        joined.add(&chains).unwrap();
        assert_eq!(joined.nchains(), 4);
        assert_eq!(joined.nsamples(), 8);
        assert!(joined.add(&Chains::new(3).unwrap()).is_err());
    }

    #[test]
    fn blocks_cover_all_samples() {
        let mut chains = Chains::new(1).unwrap();
        let samples = (0..100).map(|x| x as f64).collect_vec();
        chains.add_chains_2d(&samples, &samples, 2).unwrap();

        let blocks = chains.split_into_blocks(10).unwrap();
        assert_eq!(blocks.nchains(), 10);
        assert_eq!(blocks.samples(), chains.samples());
        assert_eq!(blocks.nsamples_per_chain(), vec![10; 10]);
        assert!(chains.split_into_blocks(1).is_err());
    }
}
