use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::{debug, instrument, trace, warn};

use crate::algorithm::params::{ppm_error, ppm_window, validate_bounds, DecompositionParams};
use crate::algorithm::residue::{alphabet_mask, check_integer_range, ResidueTable, ResidueTableCache, Weight, DEFAULT_PRECISION};
use crate::chemistry::formula::Formula;
use crate::error::{DecompositionError, Result};

/// Decomposes exact masses into elemental formulas inside fixed element bounds.
///
/// All preprocessing happens in the constructor, a built decomposer is
/// immutable and can be shared between threads.
///
/// # Example
///
/// ```
/// use msdecomp::algorithm::decomposer::MassDecomposer;
/// use msdecomp::algorithm::params::DecompositionParams;
/// use msdecomp::chemistry::elements::Element;
///
/// let params = DecompositionParams::builder()
///     .tolerance_ppm(5.0)
///     .dbe_range(-10.0, 10.0)
///     .element(Element::C, 0, 6)
///     .element(Element::H, 0, 12)
///     .element(Element::O, 0, 6)
///     .build()
///     .unwrap();
///
/// let decomposer = MassDecomposer::from_params(&params).unwrap();
/// let formulas = decomposer.decompose(180.06339, &params).unwrap();
/// assert_eq!(formulas.len(), 1);
/// assert_eq!(formulas[0].to_string(), "C6H12O6");
/// ```
#[derive(Debug, Clone)]
pub struct MassDecomposer {
    min_bounds: Formula,
    max_bounds: Formula,
    precision: f64,
    weights: Vec<Weight>,
    table: Arc<ResidueTable>,
    base_mass: f64,
    max_integer_mass: i64,
}

impl MassDecomposer {
    pub fn new(min_bounds: Formula, max_bounds: Formula) -> Result<Self> {
        Self::with_precision(min_bounds, max_bounds, DEFAULT_PRECISION)
    }

    /// Build a decomposer with a custom discretization precision in Dalton.
    #[instrument(level = "debug", skip(min_bounds, max_bounds))]
    pub fn with_precision(min_bounds: Formula, max_bounds: Formula, precision: f64) -> Result<Self> {
        validate_bounds(&min_bounds, &max_bounds)?;
        check_integer_range(&min_bounds, &max_bounds, precision)?;
        let table = Arc::new(ResidueTable::new(alphabet_mask(&min_bounds, &max_bounds), precision)?);
        Self::with_table(min_bounds, max_bounds, precision, table)
    }

    /// Build from the element bounds of `params`.
    pub fn from_params(params: &DecompositionParams) -> Result<Self> {
        Self::new(params.min_bounds, params.max_bounds)
    }

    /// Build on top of a residue table taken from `cache`, building it if needed.
    pub fn with_cache(
        min_bounds: Formula,
        max_bounds: Formula,
        precision: f64,
        cache: &mut ResidueTableCache,
    ) -> Result<Self> {
        validate_bounds(&min_bounds, &max_bounds)?;
        check_integer_range(&min_bounds, &max_bounds, precision)?;
        let table = cache.get_or_build(alphabet_mask(&min_bounds, &max_bounds), precision)?;
        Self::with_table(min_bounds, max_bounds, precision, table)
    }

    fn with_table(min_bounds: Formula, max_bounds: Formula, precision: f64, table: Arc<ResidueTable>) -> Result<Self> {
        // the table may cover more elements than the search varies, those get a
        // zero range and only ever take their lower bound
        let mask = alphabet_mask(&min_bounds, &max_bounds);
        debug_assert_eq!(table.mask() & mask, mask);

        let weights: Vec<Weight> = table
            .elements()
            .iter()
            .zip(table.integer_masses())
            .map(|(&element, &integer_mass)| Weight {
                element,
                mass: element.monoisotopic_mass(),
                integer_mass,
                min_count: min_bounds[element],
                max_count: max_bounds[element],
            })
            .collect();

        // the search can never exceed the mass of the largest bounded residual
        let mut max_integer_mass: i64 = 0;
        for weight in &weights {
            max_integer_mass = (weight.range() as i64)
                .checked_mul(weight.integer_mass)
                .and_then(|m| m.checked_add(max_integer_mass))
                .ok_or(DecompositionError::NumericOverflow { element: weight.element })?;
        }

        debug!(
            alphabet = weights.len(),
            max_integer_mass,
            "decomposer ready"
        );

        Ok(MassDecomposer {
            min_bounds,
            max_bounds,
            precision,
            weights,
            table,
            base_mass: min_bounds.monoisotopic_mass(),
            max_integer_mass,
        })
    }

    /// Same lower bounds, upper bounds capped element-wise by `cap`.
    ///
    /// The capped alphabet is a subset of this one, so the residue table is
    /// shared as is.
    pub(crate) fn capped(&self, cap: &Formula) -> Result<Self> {
        let max_bounds = self.max_bounds.element_min(cap);
        validate_bounds(&self.min_bounds, &max_bounds)?;
        Self::with_table(self.min_bounds, max_bounds, self.precision, Arc::clone(&self.table))
    }

    /// Seed `cache` with this decomposer's residue table.
    pub(crate) fn share_table(&self, cache: &mut ResidueTableCache) {
        cache.insert(self.precision, Arc::clone(&self.table));
    }

    pub fn min_bounds(&self) -> &Formula {
        &self.min_bounds
    }

    pub fn max_bounds(&self) -> &Formula {
        &self.max_bounds
    }

    /// Requested discretization precision.
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Search alphabet in ascending integer mass order.
    pub fn weights(&self) -> &[Weight] {
        &self.weights
    }

    pub fn table(&self) -> &ResidueTable {
        &self.table
    }

    /// Decompose `target_mass` into all formulas within the bounds, the ppm
    /// tolerance and the DBE range of `params`.
    ///
    /// The element bounds of `params` are ignored, the decomposer's own bounds
    /// apply. Results are sorted by absolute ppm error, ties by element counts
    /// in slot order, and cut to `params.max_results` when that is non-zero.
    /// No match is an empty vector.
    pub fn decompose(&self, target_mass: f64, params: &DecompositionParams) -> Result<Vec<Formula>> {
        params.validate_search()?;
        Ok(self.search(target_mass, params))
    }

    /// `decompose` without parameter validation.
    pub(crate) fn search(&self, target_mass: f64, params: &DecompositionParams) -> Vec<Formula> {
        if !target_mass.is_finite() {
            warn!(target_mass, "skipping non-finite target mass");
            return Vec::new();
        }
        if target_mass <= 0.0 {
            return Vec::new();
        }

        let (mass_from, mass_to) = ppm_window(target_mass, params.tolerance_ppm);
        let mut candidates: Vec<(OrderedFloat<f64>, Formula)> = Vec::new();

        self.enumerate(mass_from, mass_to, &mut |formula| {
            let mass = formula.monoisotopic_mass();
            if mass < mass_from || mass > mass_to {
                return;
            }
            if !params.dbe_ok(formula.dbe()) {
                return;
            }
            candidates.push((OrderedFloat(ppm_error(mass, target_mass).abs()), formula));
        });

        candidates.sort_unstable();
        if params.max_results > 0 {
            candidates.truncate(params.max_results);
        }

        trace!(target_mass, found = candidates.len(), "decomposed");
        candidates.into_iter().map(|(_, formula)| formula).collect()
    }

    /// Every formula within bounds whose integer mass may fall into
    /// `[mass_from, mass_to]`, unfiltered.
    fn enumerate(&self, mass_from: f64, mass_to: f64, emit: &mut dyn FnMut(Formula)) {
        if self.weights.is_empty() {
            emit(self.min_bounds);
            return;
        }

        let Some((start, end)) = self
            .table
            .integer_bound(mass_from - self.base_mass, mass_to - self.base_mass)
        else {
            return;
        };
        let end = end.min(self.max_integer_mass);

        let top = self.weights.len() - 1;
        let mut counts = vec![0i32; self.weights.len()];
        for m in start..=end {
            if self.table.decomposable_fast(m) {
                self.integer_decompose(top, m, &mut counts, emit);
            }
        }
    }

    /// Depth first enumeration of the exact decompositions of integer mass `m`
    /// over the first `i + 1` weights, heaviest first.
    fn integer_decompose(&self, i: usize, m: i64, counts: &mut [i32], emit: &mut dyn FnMut(Formula)) {
        let weight = &self.weights[i];

        if i == 0 {
            if m % weight.integer_mass == 0 && m / weight.integer_mass <= weight.range() as i64 {
                counts[0] = (m / weight.integer_mass) as i32;
                emit(self.assemble(counts));
                counts[0] = 0;
            }
            return;
        }

        let max_count = (weight.range() as i64).min(m / weight.integer_mass);
        for count in 0..=max_count {
            let rest = m - count * weight.integer_mass;
            if self.table.decomposable(i - 1, rest) {
                counts[i] = count as i32;
                self.integer_decompose(i - 1, rest, counts, emit);
            }
        }
        counts[i] = 0;
    }

    fn assemble(&self, counts: &[i32]) -> Formula {
        let mut formula = self.min_bounds;
        for (weight, &count) in self.weights.iter().zip(counts) {
            formula[weight.element] += count;
        }
        formula
    }
}

/// Decompose a single mass with a decomposer built from `params`.
pub fn decompose(target_mass: f64, params: &DecompositionParams) -> Result<Vec<Formula>> {
    params.validate()?;
    MassDecomposer::from_params(params)?.decompose(target_mass, params)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::chemistry::elements::Element;

    fn glucose_params() -> DecompositionParams {
        DecompositionParams::builder()
            .tolerance_ppm(5.0)
            .dbe_range(-100.0, 100.0)
            .element(Element::C, 0, 6)
            .element(Element::H, 0, 12)
            .element(Element::O, 0, 6)
            .build()
            .unwrap()
    }

    #[test]
    fn test_glucose() {
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let result = decomposer.decompose(180.06339, &params).unwrap();
        let glucose = Formula::from_pairs(&[(Element::C, 6), (Element::H, 12), (Element::O, 6)]);
        assert_eq!(result, vec![glucose]);
        assert!(ppm_error(glucose.monoisotopic_mass(), 180.06339).abs() < 0.1);
    }

    #[test]
    fn test_results_respect_window_bounds_and_dbe() {
        let params = DecompositionParams::builder()
            .tolerance_ppm(10.0)
            .dbe_range(0.0, 8.0)
            .element(Element::C, 1, 20)
            .element(Element::H, 0, 40)
            .element(Element::N, 0, 5)
            .element(Element::O, 0, 8)
            .element(Element::S, 0, 2)
            .build()
            .unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();

        for target in [151.0633, 194.0804, 256.2402, 180.0634] {
            let result = decomposer.decompose(target, &params).unwrap();
            assert!(!result.is_empty(), "no formula for {}", target);
            for formula in &result {
                let mass = formula.monoisotopic_mass();
                assert!((mass - target).abs() <= params.tolerance_da(target) + 1e-12, "{} {}", formula, mass);
                assert!(formula.within(&params.min_bounds, &params.max_bounds), "{}", formula);
                assert!(params.dbe_ok(formula.dbe()), "{}", formula);
            }
        }
    }

    #[test]
    fn test_matches_brute_force() {
        let params = DecompositionParams::builder()
            .tolerance_ppm(20.0)
            .dbe_range(-5.0, 20.0)
            .element(Element::C, 0, 12)
            .element(Element::H, 0, 24)
            .element(Element::N, 0, 4)
            .element(Element::O, 0, 6)
            .build()
            .unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let target = 204.0899;
        let (lo, hi) = ppm_window(target, params.tolerance_ppm);

        let mut expected = Vec::new();
        for c in 0..=12 {
            for h in 0..=24 {
                for n in 0..=4 {
                    for o in 0..=6 {
                        let f = Formula::from_pairs(&[(Element::C, c), (Element::H, h), (Element::N, n), (Element::O, o)]);
                        let mass = f.monoisotopic_mass();
                        if lo <= mass && mass <= hi && params.dbe_ok(f.dbe()) {
                            expected.push(f);
                        }
                    }
                }
            }
        }
        expected.sort();

        let mut found = decomposer.decompose(target, &params).unwrap();
        found.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_lower_bounds_are_honoured() {
        let mut params = glucose_params();
        params.min_bounds[Element::C] = 6;
        params.min_bounds[Element::O] = 6;
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let result = decomposer.decompose(180.06339, &params).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].to_string(), "C6H12O6");

        // nothing lighter than C6O6 can be reached
        assert!(decomposer.decompose(162.0528, &params).unwrap().is_empty());
    }

    #[test]
    fn test_fixed_bounds() {
        let glucose: Formula = "C6H12O6".parse().unwrap();
        let mut params = glucose_params();
        params.min_bounds = glucose;
        params.max_bounds = glucose;
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        assert!(decomposer.weights().is_empty());
        assert_eq!(decomposer.decompose(180.06339, &params).unwrap(), vec![glucose]);
        assert!(decomposer.decompose(181.0, &params).unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_and_degenerate_masses() {
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        assert!(decomposer.decompose(5000.0, &params).unwrap().is_empty());
        assert!(decomposer.decompose(0.0, &params).unwrap().is_empty());
        assert!(decomposer.decompose(-12.0, &params).unwrap().is_empty());
        assert!(decomposer.decompose(f64::NAN, &params).unwrap().is_empty());
    }

    #[test]
    fn test_dbe_filter() {
        let mut params = glucose_params();
        // glucose has a DBE of 1
        params.min_dbe = 1.5;
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        assert!(decomposer.decompose(180.06339, &params).unwrap().is_empty());
        params.min_dbe = 1.0;
        params.max_dbe = 1.0;
        assert_eq!(decomposer.decompose(180.06339, &params).unwrap().len(), 1);
    }

    #[test]
    fn test_truncation_is_ordered_by_error() {
        let params = DecompositionParams::builder()
            .tolerance_ppm(50.0)
            .dbe_range(-20.0, 40.0)
            .element(Element::C, 0, 30)
            .element(Element::H, 0, 60)
            .element(Element::N, 0, 10)
            .element(Element::O, 0, 10)
            .element(Element::S, 0, 3)
            .element(Element::P, 0, 3)
            .build()
            .unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let target = 400.1;
        let all = decomposer.decompose(target, &params).unwrap();
        assert!(all.len() > 3);

        let errors: Vec<f64> = all.iter().map(|f| ppm_error(f.monoisotopic_mass(), target).abs()).collect();
        assert!(errors.windows(2).all(|w| w[0] <= w[1]));

        let mut capped = params.clone();
        capped.max_results = 3;
        let truncated = decomposer.decompose(target, &capped).unwrap();
        assert_eq!(truncated, all[..3].to_vec());
    }

    #[test]
    fn test_deterministic() {
        let params = DecompositionParams::permissive();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let a = decomposer.decompose(285.0789, &params).unwrap();
        let b = decomposer.decompose(285.0789, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_formulas_round_trip() {
        let params = DecompositionParams::builder()
            .tolerance_ppm(2.0)
            .dbe_range(-50.0, 50.0)
            .element(Element::C, 0, 25)
            .element(Element::H, 0, 40)
            .element(Element::N, 0, 6)
            .element(Element::O, 0, 10)
            .element(Element::Cl, 0, 2)
            .element(Element::Na, 0, 1)
            .build()
            .unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..25 {
            let mut formula = Formula::zeros();
            for element in Element::ALL {
                formula[element] = rng.gen_range(0..=params.max_bounds[element]);
            }
            if formula.atom_count() == 0 {
                continue;
            }
            let result = decomposer.decompose(formula.monoisotopic_mass(), &params).unwrap();
            assert!(result.contains(&formula), "{} not recovered", formula);
        }
    }

    #[test]
    fn test_configuration_errors() {
        let mut min = Formula::zeros();
        let max = Formula::from_pairs(&[(Element::C, 2)]);
        min[Element::C] = 3;
        assert!(MassDecomposer::new(min, max).unwrap_err().is_configuration());

        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let mut bad = params.clone();
        bad.tolerance_ppm = 0.0;
        assert!(decomposer.decompose(180.0, &bad).is_err());
    }

    #[test]
    fn test_overflowing_bounds_fail_fast() {
        let max = Formula::from_pairs(&[(Element::H, i32::MAX), (Element::I, i32::MAX)]);
        let result = MassDecomposer::with_precision(Formula::zeros(), max, 1e-12);
        assert!(matches!(result, Err(DecompositionError::NumericOverflow { .. })));
    }

    #[test]
    fn test_free_function() {
        let params = glucose_params();
        let result = decompose(180.06339, &params).unwrap();
        assert_eq!(result.len(), 1);
    }
}
