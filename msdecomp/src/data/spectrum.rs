use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::chemistry::formula::Formula;

/// A precursor mass with its fragment masses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Spectrum {
    pub precursor_mass: f64,
    pub fragment_masses: Vec<f64>,
}

impl Spectrum {
    pub fn new(precursor_mass: f64, fragment_masses: Vec<f64>) -> Self {
        Spectrum { precursor_mass, fragment_masses }
    }
}

/// A spectrum carrying its own precursor element bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SpectrumWithBounds {
    pub precursor_mass: f64,
    pub fragment_masses: Vec<f64>,
    pub precursor_min_bounds: Formula,
    pub precursor_max_bounds: Formula,
}

impl SpectrumWithBounds {
    pub fn new(
        precursor_mass: f64,
        fragment_masses: Vec<f64>,
        precursor_min_bounds: Formula,
        precursor_max_bounds: Formula,
    ) -> Self {
        SpectrumWithBounds {
            precursor_mass,
            fragment_masses,
            precursor_min_bounds,
            precursor_max_bounds,
        }
    }

    pub fn bounds(&self) -> (Formula, Formula) {
        (self.precursor_min_bounds, self.precursor_max_bounds)
    }
}

/// Fragment masses of a precursor whose formula is already known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SpectrumWithKnownPrecursor {
    pub precursor_formula: Formula,
    pub fragment_masses: Vec<f64>,
}

impl SpectrumWithKnownPrecursor {
    pub fn new(precursor_formula: Formula, fragment_masses: Vec<f64>) -> Self {
        SpectrumWithKnownPrecursor { precursor_formula, fragment_masses }
    }
}

/// Fragment annotations under one precursor candidate.
///
/// # Description
///
/// `fragments[i]`, `fragment_masses[i]` and `fragment_errors_ppm[i]` belong to
/// input fragment mass `i` and are parallel to each other. A fragment without
/// any formula keeps an empty slot. Every fragment formula is a subset of
/// `precursor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SpectrumDecomposition {
    pub precursor: Formula,
    pub fragments: Vec<Vec<Formula>>,
    pub precursor_mass: f64,
    pub precursor_error_ppm: f64,
    pub fragment_masses: Vec<Vec<f64>>,
    pub fragment_errors_ppm: Vec<Vec<f64>>,
}

impl SpectrumDecomposition {
    pub fn new(precursor: Formula, precursor_mass: f64, precursor_error_ppm: f64, num_fragments: usize) -> Self {
        SpectrumDecomposition {
            precursor,
            fragments: Vec::with_capacity(num_fragments),
            precursor_mass,
            precursor_error_ppm,
            fragment_masses: Vec::with_capacity(num_fragments),
            fragment_errors_ppm: Vec::with_capacity(num_fragments),
        }
    }

    /// Append the annotation of the next fragment mass.
    pub fn push_fragment(&mut self, formulas: Vec<Formula>, masses: Vec<f64>, errors_ppm: Vec<f64>) {
        debug_assert!(formulas.len() == masses.len() && masses.len() == errors_ppm.len());
        self.fragments.push(formulas);
        self.fragment_masses.push(masses);
        self.fragment_errors_ppm.push(errors_ppm);
    }

    /// Number of fragment masses covered.
    pub fn num_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Number of fragment masses with at least one formula.
    pub fn num_explained(&self) -> usize {
        self.fragments.iter().filter(|f| !f.is_empty()).count()
    }

    /// Neutral loss (precursor minus fragment) for every fragment formula,
    /// same layout as `fragments`.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::formula::Formula;
    /// use msdecomp::data::spectrum::SpectrumDecomposition;
    ///
    /// let precursor: Formula = "C6H12O6".parse().unwrap();
    /// let fragment: Formula = "C6H10O5".parse().unwrap();
    /// let mut decomposition = SpectrumDecomposition::new(precursor, precursor.monoisotopic_mass(), 0.0, 1);
    /// decomposition.push_fragment(vec![fragment], vec![fragment.monoisotopic_mass()], vec![0.0]);
    /// assert_eq!(decomposition.neutral_losses()[0][0].to_string(), "H2O");
    /// ```
    pub fn neutral_losses(&self) -> Vec<Vec<Formula>> {
        self.fragments
            .iter()
            .map(|formulas| {
                formulas
                    .iter()
                    .filter_map(|fragment| self.precursor.checked_sub(fragment))
                    .collect()
            })
            .collect()
    }
}

/// All precursor interpretations of one spectrum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ProperSpectrumResults {
    pub decompositions: Vec<SpectrumDecomposition>,
}

impl ProperSpectrumResults {
    pub fn new(decompositions: Vec<SpectrumDecomposition>) -> Self {
        ProperSpectrumResults { decompositions }
    }

    pub fn len(&self) -> usize {
        self.decompositions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decompositions.is_empty()
    }

    pub fn precursors(&self) -> Vec<Formula> {
        self.decompositions.iter().map(|d| d.precursor).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpectrumDecomposition> {
        self.decompositions.iter()
    }

    /// Decomposition for a given precursor formula, if it was a candidate.
    pub fn get(&self, precursor: &Formula) -> Option<&SpectrumDecomposition> {
        self.decompositions.iter().find(|d| &d.precursor == precursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glucose_decomposition() -> SpectrumDecomposition {
        let precursor: Formula = "C6H12O6".parse().unwrap();
        let mut decomposition = SpectrumDecomposition::new(precursor, precursor.monoisotopic_mass(), 0.01, 2);
        let fragment: Formula = "C6H10O5".parse().unwrap();
        decomposition.push_fragment(vec![fragment], vec![fragment.monoisotopic_mass()], vec![-0.2]);
        decomposition.push_fragment(Vec::new(), Vec::new(), Vec::new());
        decomposition
    }

    #[test]
    fn test_fragment_slots() {
        let decomposition = glucose_decomposition();
        assert_eq!(decomposition.num_fragments(), 2);
        assert_eq!(decomposition.num_explained(), 1);
        assert!(decomposition.neutral_losses()[1].is_empty());
    }

    #[test]
    fn test_results_lookup() {
        let decomposition = glucose_decomposition();
        let precursor = decomposition.precursor;
        let results = ProperSpectrumResults::new(vec![decomposition]);
        assert_eq!(results.len(), 1);
        assert_eq!(results.precursors(), vec![precursor]);
        assert!(results.get(&precursor).is_some());
        assert!(results.get(&Formula::zeros()).is_none());
        assert!(ProperSpectrumResults::default().is_empty());
    }

    #[test]
    fn test_bincode_round_trip() {
        let results = ProperSpectrumResults::new(vec![glucose_decomposition()]);
        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&results, config).unwrap();
        let (decoded, _): (ProperSpectrumResults, usize) = bincode::decode_from_slice(&bytes, config).unwrap();
        assert_eq!(decoded, results);
    }

    #[test]
    fn test_json_layout() {
        let spectrum = SpectrumWithKnownPrecursor::new("H2O".parse().unwrap(), vec![17.0027]);
        let json = serde_json::to_string(&spectrum).unwrap();
        assert_eq!(
            json,
            r#"{"precursor_formula":[2,0,0,0,1,0,0,0,0,0,0,0,0,0,0],"fragment_masses":[17.0027]}"#
        );
    }
}
