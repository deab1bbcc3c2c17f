use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, instrument};

use crate::algorithm::decomposer::MassDecomposer;
use crate::algorithm::params::{validate_bounds, DecompositionParams};
use crate::algorithm::residue::{alphabet_mask, ResidueTableCache, DEFAULT_PRECISION};
use crate::chemistry::formula::Formula;
use crate::error::{DecompositionError, Result};

/// One shared decomposer per distinct `(min_bounds, max_bounds)` pair.
///
/// Decomposers share a residue table whenever a cached one covers their
/// alphabet. The cache is filled on the calling thread, workers only get the
/// finished `Arc`s.
#[derive(Debug)]
pub struct DecomposerCache {
    precision: f64,
    decomposers: HashMap<(Formula, Formula), Arc<MassDecomposer>>,
    tables: ResidueTableCache,
}

impl Default for DecomposerCache {
    fn default() -> Self {
        DecomposerCache::new(DEFAULT_PRECISION)
    }
}

impl DecomposerCache {
    pub fn new(precision: f64) -> Self {
        DecomposerCache {
            precision,
            decomposers: HashMap::new(),
            tables: ResidueTableCache::new(),
        }
    }

    pub fn get_or_build(&mut self, min_bounds: &Formula, max_bounds: &Formula) -> Result<Arc<MassDecomposer>> {
        if let Some(decomposer) = self.decomposers.get(&(*min_bounds, *max_bounds)) {
            return Ok(Arc::clone(decomposer));
        }
        let decomposer = Arc::new(MassDecomposer::with_cache(
            *min_bounds,
            *max_bounds,
            self.precision,
            &mut self.tables,
        )?);
        self.decomposers.insert((*min_bounds, *max_bounds), Arc::clone(&decomposer));
        Ok(decomposer)
    }

    /// Decomposer for every pair, in input order.
    ///
    /// All pairs are checked first, then one residue table over every element
    /// any pair varies is built and shared by all decomposers. Fails on the
    /// first invalid pair, before any table is built.
    pub fn resolve(&mut self, bounds: &[(Formula, Formula)]) -> Result<Vec<Arc<MassDecomposer>>> {
        let union = bounds.iter().try_fold(0u16, |mask, (min_bounds, max_bounds)| {
            validate_bounds(min_bounds, max_bounds).map(|_| mask | alphabet_mask(min_bounds, max_bounds))
        })?;
        if !bounds.is_empty() {
            self.tables.get_or_build(union, self.precision)?;
        }

        let decomposers = bounds
            .iter()
            .map(|(min_bounds, max_bounds)| self.get_or_build(min_bounds, max_bounds))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            requested = bounds.len(),
            decomposers = self.decomposers.len(),
            tables = self.tables.len(),
            "resolved decomposers"
        );
        Ok(decomposers)
    }

    pub fn len(&self) -> usize {
        self.decomposers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decomposers.is_empty()
    }

    /// Number of distinct residue tables behind the cached decomposers.
    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }
}

/// Worker pool with `num_threads` threads, `0` picks rayon's default.
pub(crate) fn build_pool(num_threads: usize) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new().num_threads(num_threads).build()?)
}

/// Decompose many masses in parallel with the bounds of `params`.
///
/// Arguments:
///
/// * `target_masses` - masses to decompose
/// * `params` - tolerance, DBE range, result cap and element bounds
/// * `num_threads` - size of the worker pool, `0` for rayon's default
///
/// Returns:
///
/// * `Vec<Vec<Formula>>` - `result[i]` holds the formulas of `target_masses[i]`
///
/// # Examples
///
/// ```
/// use msdecomp::algorithm::parallel::decompose_parallel;
/// use msdecomp::algorithm::params::DecompositionParams;
/// use msdecomp::chemistry::elements::Element;
///
/// let params = DecompositionParams::builder()
///     .element(Element::C, 0, 6)
///     .element(Element::H, 0, 12)
///     .element(Element::O, 0, 6)
///     .build()
///     .unwrap();
/// let result = decompose_parallel(&[180.06339, 18.010565], &params, 2).unwrap();
/// assert_eq!(result[0][0].to_string(), "C6H12O6");
/// assert_eq!(result[1][0].to_string(), "H2O");
/// ```
#[instrument(level = "info", skip_all, fields(masses = target_masses.len()))]
pub fn decompose_parallel(
    target_masses: &[f64],
    params: &DecompositionParams,
    num_threads: usize,
) -> Result<Vec<Vec<Formula>>> {
    params.validate()?;
    let decomposer = MassDecomposer::from_params(params)?;
    let pool = build_pool(num_threads)?;

    info!(num_threads = pool.current_num_threads(), "decomposing masses");

    Ok(pool.install(|| {
        target_masses
            .par_iter()
            .map(|&mass| decomposer.search(mass, params))
            .collect()
    }))
}

/// Decompose many masses in parallel, each with its own `(min, max)` bounds.
///
/// The element bounds of `params` are ignored. One decomposer is built per
/// distinct bound pair before the parallel work starts.
#[instrument(level = "info", skip_all, fields(masses = target_masses.len()))]
pub fn decompose_masses_parallel_per_bounds(
    target_masses: &[f64],
    per_mass_bounds: &[(Formula, Formula)],
    params: &DecompositionParams,
    num_threads: usize,
) -> Result<Vec<Vec<Formula>>> {
    if target_masses.len() != per_mass_bounds.len() {
        return Err(DecompositionError::LengthMismatch {
            masses: target_masses.len(),
            bounds: per_mass_bounds.len(),
        });
    }
    params.validate_search()?;

    let mut cache = DecomposerCache::default();
    let decomposers = cache.resolve(per_mass_bounds)?;
    let pool = build_pool(num_threads)?;

    info!(
        num_threads = pool.current_num_threads(),
        decomposers = cache.len(),
        "decomposing masses with per-mass bounds"
    );

    Ok(pool.install(|| {
        target_masses
            .par_iter()
            .zip(decomposers.par_iter())
            .map(|(&mass, decomposer)| decomposer.search(mass, params))
            .collect()
    }))
}
