use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::chemistry::elements::Element;
use crate::chemistry::formula::Formula;
use crate::error::{DecompositionError, Result};

/// Search settings for a decomposition.
///
/// # Description
///
/// `max_results == 0` means unlimited. The element bounds are used by the
/// functions that build decomposers on the fly (batch and spectrum
/// entry points); a `MassDecomposer` built for fixed bounds only reads the
/// tolerance, DBE range and result cap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct DecompositionParams {
    pub tolerance_ppm: f64,
    pub min_dbe: f64,
    pub max_dbe: f64,
    pub max_results: usize,
    pub min_bounds: Formula,
    pub max_bounds: Formula,
}

/// Default upper bounds, aimed at small organic molecules (CHNOPS).
pub fn default_max_bounds() -> Formula {
    Formula::from_pairs(&[
        (Element::H, 200),
        (Element::C, 100),
        (Element::N, 20),
        (Element::O, 40),
        (Element::P, 5),
        (Element::S, 5),
    ])
}

impl Default for DecompositionParams {
    fn default() -> Self {
        DecompositionParams {
            tolerance_ppm: 5.0,
            min_dbe: -0.5,
            max_dbe: 40.0,
            max_results: 0,
            min_bounds: Formula::zeros(),
            max_bounds: default_max_bounds(),
        }
    }
}

impl DecompositionParams {
    pub fn builder() -> DecompositionParamsBuilder {
        DecompositionParamsBuilder::new()
    }

    /// Tight settings for high resolution data: 3 ppm, closed-shell DBE range,
    /// CHNO only.
    pub fn strict() -> Self {
        DecompositionParams {
            tolerance_ppm: 3.0,
            min_dbe: 0.0,
            max_dbe: 30.0,
            max_results: 0,
            min_bounds: Formula::zeros(),
            max_bounds: Formula::from_pairs(&[
                (Element::H, 150),
                (Element::C, 80),
                (Element::N, 15),
                (Element::O, 30),
            ]),
        }
    }

    /// Wide settings: 10 ppm, relaxed DBE range, halogens admitted.
    pub fn permissive() -> Self {
        DecompositionParams {
            tolerance_ppm: 10.0,
            min_dbe: -1.0,
            max_dbe: 60.0,
            max_results: 0,
            min_bounds: Formula::zeros(),
            max_bounds: Formula::from_pairs(&[
                (Element::H, 200),
                (Element::C, 100),
                (Element::N, 20),
                (Element::O, 40),
                (Element::F, 10),
                (Element::P, 5),
                (Element::S, 5),
                (Element::Cl, 5),
                (Element::Br, 3),
            ]),
        }
    }

    /// Check tolerance, DBE range and element bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::algorithm::params::DecompositionParams;
    ///
    /// let mut params = DecompositionParams::default();
    /// assert!(params.validate().is_ok());
    /// params.tolerance_ppm = 0.0;
    /// assert!(params.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        self.validate_search()?;
        validate_bounds(&self.min_bounds, &self.max_bounds)
    }

    /// Check only the settings a prebuilt decomposer reads.
    pub(crate) fn validate_search(&self) -> Result<()> {
        if !(self.tolerance_ppm.is_finite() && self.tolerance_ppm > 0.0) {
            return Err(DecompositionError::InvalidTolerance(self.tolerance_ppm));
        }
        if self.min_dbe.is_nan() || self.max_dbe.is_nan() || self.min_dbe > self.max_dbe {
            return Err(DecompositionError::InvalidDbeRange { min: self.min_dbe, max: self.max_dbe });
        }
        Ok(())
    }

    /// Absolute tolerance in Dalton around `mass`.
    #[inline]
    pub fn tolerance_da(&self, mass: f64) -> f64 {
        mass * self.tolerance_ppm * 1e-6
    }

    #[inline]
    pub fn dbe_ok(&self, dbe: f64) -> bool {
        self.min_dbe <= dbe && dbe <= self.max_dbe
    }
}

/// Check that `0 <= min[e] <= max[e]` for every element.
pub fn validate_bounds(min_bounds: &Formula, max_bounds: &Formula) -> Result<()> {
    for element in Element::ALL {
        let (min, max) = (min_bounds[element], max_bounds[element]);
        if min < 0 {
            return Err(DecompositionError::NegativeBound { element, value: min });
        }
        if max < 0 {
            return Err(DecompositionError::NegativeBound { element, value: max });
        }
        if min > max {
            return Err(DecompositionError::InvalidBounds { element, min, max });
        }
    }
    Ok(())
}

/// Relative mass error in ppm of a calculated mass against a target mass.
///
/// # Example
///
/// ```
/// use msdecomp::algorithm::params::ppm_error;
///
/// assert!((ppm_error(100.0001, 100.0) - 1.0).abs() < 1e-6);
/// ```
#[inline]
pub fn ppm_error(calculated: f64, target: f64) -> f64 {
    (calculated - target) / target * 1e6
}

/// Inclusive mass window of `tolerance_ppm` around `mass`.
#[inline]
pub fn ppm_window(mass: f64, tolerance_ppm: f64) -> (f64, f64) {
    let delta = mass * tolerance_ppm * 1e-6;
    (mass - delta, mass + delta)
}

#[derive(Default)]
pub struct DecompositionParamsBuilder {
    tolerance_ppm: Option<f64>,
    min_dbe: Option<f64>,
    max_dbe: Option<f64>,
    max_results: Option<usize>,
    min_bounds: Option<Formula>,
    max_bounds: Option<Formula>,
}

impl DecompositionParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tolerance_ppm(mut self, ppm: f64) -> Self {
        self.tolerance_ppm = Some(ppm);
        self
    }
    pub fn dbe_range(mut self, min: f64, max: f64) -> Self {
        self.min_dbe = Some(min);
        self.max_dbe = Some(max);
        self
    }
    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = Some(n);
        self
    }
    pub fn min_bounds(mut self, bounds: Formula) -> Self {
        self.min_bounds = Some(bounds);
        self
    }
    pub fn max_bounds(mut self, bounds: Formula) -> Self {
        self.max_bounds = Some(bounds);
        self
    }
    /// Set both bounds of one element.
    pub fn element(mut self, element: Element, min: i32, max: i32) -> Self {
        self.min_bounds.get_or_insert_with(Formula::zeros)[element] = min;
        self.max_bounds.get_or_insert_with(Formula::zeros)[element] = max;
        self
    }

    /// Fill unset fields from `DecompositionParams::default()` and validate.
    ///
    /// Bounds set through `element` start from all-zero formulas, not from the
    /// default bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::algorithm::params::DecompositionParams;
    /// use msdecomp::chemistry::elements::Element;
    ///
    /// let params = DecompositionParams::builder()
    ///     .tolerance_ppm(5.0)
    ///     .element(Element::C, 0, 6)
    ///     .element(Element::H, 0, 12)
    ///     .element(Element::O, 0, 6)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(params.max_bounds[Element::N], 0);
    /// ```
    pub fn build(self) -> Result<DecompositionParams> {
        let defaults = DecompositionParams::default();
        let params = DecompositionParams {
            tolerance_ppm: self.tolerance_ppm.unwrap_or(defaults.tolerance_ppm),
            min_dbe: self.min_dbe.unwrap_or(defaults.min_dbe),
            max_dbe: self.max_dbe.unwrap_or(defaults.max_dbe),
            max_results: self.max_results.unwrap_or(defaults.max_results),
            min_bounds: self.min_bounds.unwrap_or(defaults.min_bounds),
            max_bounds: self.max_bounds.unwrap_or(defaults.max_bounds),
        };
        params.validate()?;
        Ok(params)
    }
}
