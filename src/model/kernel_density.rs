use std::{collections::HashMap, ops::Range};

use faer::Col;
use itertools::{izip, Itertools};
use tracing::debug;

use crate::{
    error::{HarmonicError, Result},
    math::{column_moments, ln_ball_volume},
    model::{check_fit_input, check_position, DensityModel, Domain, ModelFamily},
};

/// Settings of the kernel density estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelDensityHyperParameters {
    /// Kernel radius in units of the per-dimension standard deviation.
    pub radius: f64,
}

impl Default for KernelDensityHyperParameters {
    fn default() -> Self {
        Self { radius: 0.5 }
    }
}

/// Number of leading whitened coordinates the kernels are binned by.
const MAX_INDEX_DIMS: usize = 3;

type Cell = [i64; MAX_INDEX_DIMS];

/// Kernel density estimate with uniform ball kernels.
///
/// Every training sample carries a ball of fixed radius in whitened
/// coordinates. The density at a position is the fraction of balls covering
/// it divided by the ball volume. The domain is kept for a uniform
/// interface but not searched.
///
/// Kernel centres are binned on a grid with the kernel radius as cell size
/// over the leading coordinates, so a prediction only visits the cells next
/// to the position.
#[derive(Debug, Clone)]
pub struct KernelDensityEstimate {
    ndim: usize,
    domain: Domain,
    params: KernelDensityHyperParameters,
    centre: Col<f64>,
    inv_std: Col<f64>,
    /// Whitened kernel centres, row-major and ordered by cell.
    whitened: Vec<f64>,
    cells: HashMap<Cell, Range<usize>>,
    ln_norm: f64,
    fitted: bool,
}

impl KernelDensityEstimate {
    pub fn new(ndim: usize, domain: Domain, params: KernelDensityHyperParameters) -> Result<Self> {
        if ndim == 0 {
            return Err(HarmonicError::Configuration(
                "kernel density estimate needs at least one dimension".into(),
            ));
        }
        if !(params.radius.is_finite() && params.radius > 0.) {
            return Err(HarmonicError::Configuration(format!(
                "kernel radius must be finite and positive, got {}",
                params.radius
            )));
        }
        Ok(Self {
            ndim,
            domain,
            params,
            centre: Col::zeros(ndim),
            inv_std: Col::zeros(ndim),
            whitened: Vec::new(),
            cells: HashMap::new(),
            ln_norm: f64::NEG_INFINITY,
            fitted: false,
        })
    }

    pub fn hyper_parameters(&self) -> &KernelDensityHyperParameters {
        &self.params
    }

    /// Number of training samples carrying a kernel.
    pub fn nkernels(&self) -> usize {
        self.whitened.len() / self.ndim
    }

    /// Number of occupied grid cells.
    pub fn ncells(&self) -> usize {
        self.cells.len()
    }

    fn whiten_into(&self, position: &[f64], out: &mut [f64]) {
        izip!(out, position, self.centre.try_as_col_major().unwrap().as_slice(), self.inv_std.try_as_col_major().unwrap().as_slice())
            .for_each(|(o, &x, &c, &s)| *o = (x - c) * s);
    }

    fn index_dims(&self) -> usize {
        self.ndim.min(MAX_INDEX_DIMS)
    }

    fn cell_of(&self, whitened: &[f64]) -> Cell {
        let mut cell = [0; MAX_INDEX_DIMS];
        izip!(cell.iter_mut(), whitened.iter().take(self.index_dims()))
            .for_each(|(c, &x)| *c = (x / self.params.radius).floor() as i64);
        cell
    }

    /// Order the whitened centres by cell and record the row range of every cell.
    fn build_index(&mut self, whitened: Vec<f64>) {
        let rows = whitened
            .chunks_exact(self.ndim)
            .map(|x| (self.cell_of(x), x))
            .sorted_by_key(|(cell, _)| *cell)
            .collect_vec();

        let mut ordered = Vec::with_capacity(whitened.len());
        let mut cells: HashMap<Cell, Range<usize>> = HashMap::new();
        for (i, (cell, x)) in rows.iter().enumerate() {
            ordered.extend_from_slice(x);
            cells.entry(*cell).or_insert(i..i).end = i + 1;
        }
        self.whitened = ordered;
        self.cells = cells;
    }

    /// Number of kernels covering the whitened position `x`.
    fn count_covering(&self, x: &[f64]) -> usize {
        let radius_sq = self.params.radius * self.params.radius;
        let centre_cell = self.cell_of(x);
        let index_dims = self.index_dims();

        let mut count = 0;
        for code in 0..3usize.pow(index_dims as u32) {
            let mut cell = centre_cell;
            let mut rest = code;
            for c in cell.iter_mut().take(index_dims) {
                *c += (rest % 3) as i64 - 1;
                rest /= 3;
            }
            let Some(rows) = self.cells.get(&cell) else {
                continue;
            };
            count += self.whitened[rows.start * self.ndim..rows.end * self.ndim]
                .chunks_exact(self.ndim)
                .filter(|centre| {
                    izip!(centre.iter(), x)
                        .map(|(c, v)| (c - v) * (c - v))
                        .sum::<f64>()
                        <= radius_sq
                })
                .count();
        }
        count
    }
}

impl DensityModel for KernelDensityEstimate {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::KernelDensity
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn fit(&mut self, samples: &[f64], ln_posterior: &[f64]) -> Result<bool> {
        let nsamples = check_fit_input(self.ndim, samples, ln_posterior)?;

        let (mean, variance) = column_moments(samples, self.ndim);
        let mut degenerate = nsamples < 2;
        self.centre = mean;
        izip!(self.inv_std.try_as_col_major_mut().unwrap().as_slice_mut(), variance.try_as_col_major().unwrap().as_slice()).for_each(|(s, &var)| {
            if var > 0. {
                *s = var.sqrt().recip();
            } else {
                degenerate = true;
                *s = 1.;
            }
        });

        let mut whitened = vec![0.; samples.len()];
        izip!(
            whitened.chunks_exact_mut(self.ndim),
            samples.chunks_exact(self.ndim)
        )
        .for_each(|(out, x)| self.whiten_into(x, out));
        self.build_index(whitened);

        // Density of one ball, mapped back through the whitening
        let ln_det_inv_std: f64 = self.inv_std.try_as_col_major().unwrap().as_slice().iter().map(|s| s.ln()).sum();
        self.ln_norm = ln_det_inv_std
            - ln_ball_volume(self.ndim, self.params.radius)
            - (nsamples as f64).ln();
        self.fitted = true;

        debug!(
            nsamples,
            ncells = self.ncells(),
            degenerate,
            "fitted kernel density estimate"
        );
        Ok(!degenerate)
    }

    fn predict(&self, position: &[f64]) -> Result<f64> {
        check_position(self.ndim, self.fitted, position)?;
        let mut x = vec![0.; self.ndim];
        self.whiten_into(position, &mut x);

        let count = self.count_covering(&x);
        if count == 0 {
            return Ok(f64::NEG_INFINITY);
        }
        Ok((count as f64).ln() + self.ln_norm)
    }
}
