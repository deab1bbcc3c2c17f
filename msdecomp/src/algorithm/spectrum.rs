use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::algorithm::decomposer::MassDecomposer;
use crate::algorithm::parallel::{build_pool, DecomposerCache};
use crate::algorithm::params::{ppm_error, DecompositionParams};
use crate::algorithm::residue::ResidueTableCache;
use crate::chemistry::elements::Element;
use crate::chemistry::formula::Formula;
use crate::data::spectrum::{
    ProperSpectrumResults, Spectrum, SpectrumDecomposition, SpectrumWithBounds, SpectrumWithKnownPrecursor,
};
use crate::error::{DecompositionError, Result};

impl MassDecomposer {
    /// Decompose a precursor mass and annotate its fragments under every
    /// precursor candidate.
    ///
    /// For each precursor formula `P` the fragments are searched with the upper
    /// bound `min(max_bounds, P)`, so every fragment formula is a subset of the
    /// precursor it is listed under. Fragment slots follow the input order and
    /// stay empty when nothing fits.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::algorithm::decomposer::MassDecomposer;
    /// use msdecomp::algorithm::params::DecompositionParams;
    /// use msdecomp::chemistry::elements::Element;
    ///
    /// let params = DecompositionParams::builder()
    ///     .element(Element::C, 0, 6)
    ///     .element(Element::H, 0, 12)
    ///     .element(Element::O, 0, 6)
    ///     .build()
    ///     .unwrap();
    /// let decomposer = MassDecomposer::from_params(&params).unwrap();
    /// let results = decomposer.decompose_spectrum(180.06339, &[162.05282], &params).unwrap();
    ///
    /// let glucose = results.get(&"C6H12O6".parse().unwrap()).unwrap();
    /// assert!(glucose.fragments[0].contains(&"C6H10O5".parse().unwrap()));
    /// ```
    pub fn decompose_spectrum(
        &self,
        precursor_mass: f64,
        fragment_masses: &[f64],
        params: &DecompositionParams,
    ) -> Result<ProperSpectrumResults> {
        params.validate_search()?;
        self.spectrum(precursor_mass, fragment_masses, params)
    }

    fn spectrum(
        &self,
        precursor_mass: f64,
        fragment_masses: &[f64],
        params: &DecompositionParams,
    ) -> Result<ProperSpectrumResults> {
        let precursors = self.search(precursor_mass, params);
        if precursors.is_empty() {
            debug!(precursor_mass, "no precursor candidates");
            return Ok(ProperSpectrumResults::default());
        }

        let mut decompositions = Vec::with_capacity(precursors.len());
        for precursor in precursors {
            let calculated = precursor.monoisotopic_mass();
            let fragment_decomposer = self.capped(&precursor)?;

            let mut decomposition = SpectrumDecomposition::new(
                precursor,
                calculated,
                ppm_error(calculated, precursor_mass),
                fragment_masses.len(),
            );
            for &fragment_mass in fragment_masses {
                let (formulas, masses, errors) = annotate(&fragment_decomposer, fragment_mass, params);
                decomposition.push_fragment(formulas, masses, errors);
            }
            decompositions.push(decomposition);
        }

        debug!(
            precursor_mass,
            candidates = decompositions.len(),
            fragments = fragment_masses.len(),
            "decomposed spectrum"
        );
        Ok(ProperSpectrumResults::new(decompositions))
    }

    /// Decompose fragment masses of a precursor with a known formula.
    ///
    /// Fragments are searched between this decomposer's lower bounds and the
    /// precursor formula. `result[i]` belongs to `fragment_masses[i]`.
    pub fn decompose_spectrum_known_precursor(
        &self,
        precursor_formula: &Formula,
        fragment_masses: &[f64],
        params: &DecompositionParams,
    ) -> Result<Vec<Vec<Formula>>> {
        params.validate_search()?;
        check_known_precursor(self.min_bounds(), precursor_formula)?;
        // reuses this decomposer's table when it covers the precursor's elements
        let mut tables = ResidueTableCache::new();
        self.share_table(&mut tables);
        let fragment_decomposer = MassDecomposer::with_cache(*self.min_bounds(), *precursor_formula, self.precision(), &mut tables)?;
        Ok(fragment_masses
            .iter()
            .map(|&mass| fragment_decomposer.search(mass, params))
            .collect())
    }
}

fn annotate(decomposer: &MassDecomposer, mass: f64, params: &DecompositionParams) -> (Vec<Formula>, Vec<f64>, Vec<f64>) {
    let formulas = decomposer.search(mass, params);
    let masses: Vec<f64> = formulas.iter().map(Formula::monoisotopic_mass).collect();
    let errors = masses.iter().map(|&m| ppm_error(m, mass)).collect();
    (formulas, masses, errors)
}

fn check_known_precursor(min_bounds: &Formula, precursor: &Formula) -> Result<()> {
    for element in Element::ALL {
        let count = precursor[element];
        if count < 0 {
            return Err(DecompositionError::NegativeBound { element, value: count });
        }
        if count < min_bounds[element] {
            return Err(DecompositionError::PrecursorBelowMinimum {
                element,
                precursor: count,
                min: min_bounds[element],
            });
        }
    }
    Ok(())
}

/// Decompose many spectra in parallel with the bounds of `params`.
///
/// Arguments:
///
/// * `spectra` - precursor and fragment masses
/// * `params` - tolerance, DBE range, result cap and element bounds
/// * `num_threads` - size of the worker pool, `0` for rayon's default
///
/// Returns:
///
/// * `Vec<ProperSpectrumResults>` - `result[i]` belongs to `spectra[i]`
#[instrument(level = "info", skip_all, fields(spectra = spectra.len()))]
pub fn decompose_spectra_parallel(
    spectra: &[Spectrum],
    params: &DecompositionParams,
    num_threads: usize,
) -> Result<Vec<ProperSpectrumResults>> {
    params.validate()?;
    let decomposer = MassDecomposer::from_params(params)?;
    let pool = build_pool(num_threads)?;

    info!(num_threads = pool.current_num_threads(), "decomposing spectra");

    pool.install(|| {
        spectra
            .par_iter()
            .map(|spectrum| decomposer.spectrum(spectrum.precursor_mass, &spectrum.fragment_masses, params))
            .collect()
    })
}

/// Decompose many spectra in parallel, each with its own precursor bounds.
///
/// The element bounds of `params` are ignored. One decomposer is built per
/// distinct bound pair before the parallel work starts.
#[instrument(level = "info", skip_all, fields(spectra = spectra.len()))]
pub fn decompose_spectra_parallel_per_bounds(
    spectra: &[SpectrumWithBounds],
    params: &DecompositionParams,
    num_threads: usize,
) -> Result<Vec<ProperSpectrumResults>> {
    params.validate_search()?;

    let bounds: Vec<(Formula, Formula)> = spectra.iter().map(SpectrumWithBounds::bounds).collect();
    let mut cache = DecomposerCache::default();
    let decomposers = cache.resolve(&bounds)?;
    let pool = build_pool(num_threads)?;

    info!(
        num_threads = pool.current_num_threads(),
        decomposers = cache.len(),
        "decomposing spectra with per-spectrum bounds"
    );

    pool.install(|| {
        spectra
            .par_iter()
            .zip(decomposers.par_iter())
            .map(|(spectrum, decomposer)| {
                decomposer.spectrum(spectrum.precursor_mass, &spectrum.fragment_masses, params)
            })
            .collect()
    })
}

/// Decompose the fragments of many spectra with known precursor formulas.
///
/// Fragments of `spectra[i]` are bounded by `params.min_bounds` and the
/// precursor formula of that spectrum; `result[i][j]` belongs to fragment `j`
/// of spectrum `i`.
#[instrument(level = "info", skip_all, fields(spectra = spectra.len()))]
pub fn decompose_spectra_known_precursor_parallel(
    spectra: &[SpectrumWithKnownPrecursor],
    params: &DecompositionParams,
    num_threads: usize,
) -> Result<Vec<Vec<Vec<Formula>>>> {
    params.validate_search()?;

    let bounds = spectra
        .iter()
        .map(|spectrum| {
            check_known_precursor(&params.min_bounds, &spectrum.precursor_formula)?;
            Ok((params.min_bounds, spectrum.precursor_formula))
        })
        .collect::<Result<Vec<(Formula, Formula)>>>()?;
    let mut cache = DecomposerCache::default();
    let decomposers = cache.resolve(&bounds)?;
    let pool = build_pool(num_threads)?;

    info!(
        num_threads = pool.current_num_threads(),
        decomposers = cache.len(),
        "decomposing spectra with known precursors"
    );

    Ok(pool.install(|| {
        spectra
            .par_iter()
            .zip(decomposers.par_iter())
            .map(|(spectrum, decomposer)| {
                spectrum
                    .fragment_masses
                    .iter()
                    .map(|&mass| decomposer.search(mass, params))
                    .collect()
            })
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glucose_params() -> DecompositionParams {
        DecompositionParams::builder()
            .tolerance_ppm(5.0)
            .dbe_range(-10.0, 20.0)
            .element(Element::C, 0, 6)
            .element(Element::H, 0, 12)
            .element(Element::O, 0, 6)
            .build()
            .unwrap()
    }

    fn chnops_params() -> DecompositionParams {
        DecompositionParams::builder()
            .tolerance_ppm(10.0)
            .dbe_range(-1.0, 30.0)
            .element(Element::C, 0, 30)
            .element(Element::H, 0, 50)
            .element(Element::N, 0, 8)
            .element(Element::O, 0, 10)
            .element(Element::P, 0, 2)
            .element(Element::S, 0, 2)
            .build()
            .unwrap()
    }

    fn f(formula: &str) -> Formula {
        formula.parse().unwrap()
    }

    fn assert_subsets(results: &ProperSpectrumResults, fragment_count: usize) {
        for decomposition in results.iter() {
            assert_eq!(decomposition.fragments.len(), fragment_count);
            assert_eq!(decomposition.fragment_masses.len(), fragment_count);
            assert_eq!(decomposition.fragment_errors_ppm.len(), fragment_count);
            for (formulas, masses) in decomposition.fragments.iter().zip(decomposition.fragment_masses.iter()) {
                assert_eq!(formulas.len(), masses.len());
                for fragment in formulas {
                    assert!(fragment.is_subset_of(&decomposition.precursor), "{} ⊄ {}", fragment, decomposition.precursor);
                }
            }
        }
    }

    #[test]
    fn test_glucose_water_loss() {
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let results = decomposer.decompose_spectrum(180.06339, &[162.05282], &params).unwrap();

        let glucose = results.get(&f("C6H12O6")).unwrap();
        assert!(glucose.fragments[0].contains(&f("C6H10O5")));
        assert!(glucose.precursor_error_ppm.abs() < 0.1);
        let idx = glucose.fragments[0].iter().position(|x| *x == f("C6H10O5")).unwrap();
        assert!((glucose.fragment_masses[0][idx] - f("C6H10O5").monoisotopic_mass()).abs() < 1e-9);
        assert!(glucose.fragment_errors_ppm[0][idx].abs() < 5.0);
        assert_eq!(glucose.neutral_losses()[0][idx], f("H2O"));
        assert_subsets(&results, 1);
    }

    #[test]
    fn test_fragment_slots_keep_input_order() {
        let params = chnops_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        // phenylalanine with fragments: unexplainable, C8H10N, C7H7
        let fragments = [1.5, 120.08132, 91.05478];
        let results = decomposer.decompose_spectrum(165.07898, &fragments, &params).unwrap();
        assert!(!results.is_empty());
        assert_subsets(&results, fragments.len());

        let phe = results.get(&f("C9H11NO2")).unwrap();
        assert!(phe.fragments[0].is_empty());
        assert!(phe.fragments[1].contains(&f("C8H10N")));
        assert!(phe.fragments[2].contains(&f("C7H7")));
    }

    #[test]
    fn test_fragments_capped_by_each_candidate() {
        let params = chnops_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let results = decomposer.decompose_spectrum(165.07898, &[91.05478], &params).unwrap();
        assert!(!results.is_empty());
        for decomposition in results.iter() {
            let unconstrained = decomposer.decompose(91.05478, &params).unwrap();
            let expected: Vec<Formula> = unconstrained
                .into_iter()
                .filter(|x| x.is_subset_of(&decomposition.precursor))
                .collect();
            assert_eq!(decomposition.fragments[0], expected);
        }
    }

    #[test]
    fn test_halogen_fragments_share_precursor_table() {
        let params = DecompositionParams::builder()
            .tolerance_ppm(5.0)
            .dbe_range(-5.0, 20.0)
            .element(Element::C, 0, 10)
            .element(Element::H, 0, 20)
            .element(Element::Br, 0, 2)
            .element(Element::I, 0, 2)
            .build()
            .unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let bri = f("BrI");
        let iodine = f("I");

        // capping to BrI leaves only Br and I free, the table stays the CHBrI one
        let capped = decomposer.capped(&bri).unwrap();
        assert!(std::ptr::eq(capped.table(), decomposer.table()));
        assert_eq!(capped.max_bounds(), &bri);
        assert!(capped.weights().iter().all(|w| w.range() == 0 || matches!(w.element, Element::Br | Element::I)));

        let results = decomposer
            .decompose_spectrum(bri.monoisotopic_mass(), &[iodine.monoisotopic_mass()], &params)
            .unwrap();
        let decomposition = results.get(&bri).unwrap();
        assert_eq!(decomposition.fragments[0], vec![iodine]);

        let known = decomposer
            .decompose_spectrum_known_precursor(&bri, &[iodine.monoisotopic_mass()], &params)
            .unwrap();
        assert_eq!(known[0], vec![iodine]);
    }

    #[test]
    fn test_no_precursor_candidates() {
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let results = decomposer.decompose_spectrum(4321.0, &[162.05282], &params).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_known_precursor() {
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let result = decomposer
            .decompose_spectrum_known_precursor(&f("C6H12O6"), &[162.05282, 18.010565, 500.0], &params)
            .unwrap();
        assert_eq!(result.len(), 3);
        assert!(result[0].contains(&f("C6H10O5")));
        assert!(result[1].contains(&f("H2O")));
        assert!(result[2].is_empty());
        for formulas in &result {
            assert!(formulas.iter().all(|x| x.is_subset_of(&f("C6H12O6"))));
        }
    }

    #[test]
    fn test_known_precursor_outside_configured_bounds() {
        // the precursor formula is the upper bound, even beyond params.max_bounds
        let params = glucose_params();
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let result = decomposer
            .decompose_spectrum_known_precursor(&f("C2H5NO2"), &[30.03437], &params)
            .unwrap();
        assert!(result[0].contains(&f("CH4N")));
    }

    #[test]
    fn test_known_precursor_below_minimum() {
        let mut params = glucose_params();
        params.min_bounds[Element::C] = 3;
        let decomposer = MassDecomposer::from_params(&params).unwrap();
        let err = decomposer
            .decompose_spectrum_known_precursor(&f("C2H6O"), &[30.0], &params)
            .unwrap_err();
        assert!(matches!(err, DecompositionError::PrecursorBelowMinimum { element: Element::C, .. }));
    }

    #[test]
    fn test_spectra_parallel_matches_sequential() {
        let params = chnops_params();
        let spectra = vec![
            Spectrum::new(165.07898, vec![120.08132, 91.05478]),
            Spectrum::new(180.06339, vec![162.05282, 144.0423]),
            Spectrum::new(9999.0, vec![100.0]),
            Spectrum::new(75.032028, vec![]),
        ];
        let parallel = decompose_spectra_parallel(&spectra, &params, 3).unwrap();
        let decomposer = MassDecomposer::from_params(&params).unwrap();

        assert_eq!(parallel.len(), spectra.len());
        for (spectrum, result) in spectra.iter().zip(parallel.iter()) {
            let sequential = decomposer
                .decompose_spectrum(spectrum.precursor_mass, &spectrum.fragment_masses, &params)
                .unwrap();
            assert_eq!(result, &sequential);
            assert_subsets(result, spectrum.fragment_masses.len());
        }
        assert!(parallel[2].is_empty());
    }

    #[test]
    fn test_spectra_per_bounds() {
        let params = chnops_params();
        let cho: Formula = f("C10H20O8");
        let chno: Formula = f("C10H20N2O8");
        let spectra = vec![
            SpectrumWithBounds::new(165.07898, vec![120.08132], Formula::zeros(), chno),
            SpectrumWithBounds::new(165.07898, vec![120.08132], Formula::zeros(), cho),
            SpectrumWithBounds::new(180.06339, vec![162.05282], Formula::zeros(), cho),
        ];
        let results = decompose_spectra_parallel_per_bounds(&spectra, &params, 2).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].get(&f("C9H11NO2")).is_some());
        assert!(results[1].iter().all(|d| d.precursor[Element::N] == 0));
        assert!(results[2].get(&f("C6H12O6")).is_some());
        for (spectrum, result) in spectra.iter().zip(results.iter()) {
            assert!(result
                .iter()
                .all(|d| d.precursor.within(&spectrum.precursor_min_bounds, &spectrum.precursor_max_bounds)));
            assert_subsets(result, 1);
        }
    }

    #[test]
    fn test_spectra_per_bounds_rejects_bad_bounds_up_front() {
        let params = chnops_params();
        let spectra = vec![
            SpectrumWithBounds::new(180.06339, vec![162.05282], Formula::zeros(), f("C6H12O6")),
            SpectrumWithBounds::new(180.06339, vec![162.05282], f("N3"), f("C6H12O6")),
        ];
        let err = decompose_spectra_parallel_per_bounds(&spectra, &params, 2).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_known_precursor_parallel() {
        let params = glucose_params();
        let spectra = vec![
            SpectrumWithKnownPrecursor::new(f("C6H12O6"), vec![162.05282, 18.010565]),
            SpectrumWithKnownPrecursor::new(f("C2H6O"), vec![31.0184, 162.05282]),
            SpectrumWithKnownPrecursor::new(f("C6H12O6"), vec![]),
        ];
        let results = decompose_spectra_known_precursor_parallel(&spectra, &params, 2).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0][0].contains(&f("C6H10O5")));
        assert!(results[0][1].contains(&f("H2O")));
        assert!(results[1][0].contains(&f("CH3O")));
        assert!(results[1][1].is_empty());
        assert!(results[2].is_empty());

        let decomposer = MassDecomposer::from_params(&params).unwrap();
        for (spectrum, result) in spectra.iter().zip(results.iter()) {
            let sequential = decomposer
                .decompose_spectrum_known_precursor(&spectrum.precursor_formula, &spectrum.fragment_masses, &params)
                .unwrap();
            assert_eq!(result, &sequential);
        }
    }
}
