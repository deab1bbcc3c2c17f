use std::fmt::{self, Display, Formatter};
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use std::sync::OnceLock;

use bincode::{Decode, Encode};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chemistry::elements::{Element, ATOMIC_MASSES, NUM_ELEMENTS, VALENCES};
use crate::error::DecompositionError;

/// An elemental composition, one count per element slot (H, B, C, N, O, F, Na,
/// Si, P, S, Cl, K, As, Br, I).
///
/// Serializes as a plain array of 15 integers in slot order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
#[serde(transparent)]
pub struct Formula(pub [i32; NUM_ELEMENTS]);

impl Formula {
    pub const fn new(counts: [i32; NUM_ELEMENTS]) -> Self {
        Formula(counts)
    }

    pub const fn zeros() -> Self {
        Formula([0; NUM_ELEMENTS])
    }

    /// Build a formula from `(element, count)` pairs, unlisted elements are zero.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::elements::Element;
    /// use msdecomp::chemistry::formula::Formula;
    ///
    /// let water = Formula::from_pairs(&[(Element::H, 2), (Element::O, 1)]);
    /// assert_eq!(water[Element::H], 2);
    /// assert_eq!(water.to_string(), "H2O");
    /// ```
    pub fn from_pairs(pairs: &[(Element, i32)]) -> Self {
        let mut formula = Formula::zeros();
        for &(element, count) in pairs {
            formula[element] = count;
        }
        formula
    }

    pub fn counts(&self) -> &[i32; NUM_ELEMENTS] {
        &self.0
    }

    #[inline]
    pub fn get(&self, element: Element) -> i32 {
        self.0[element.index()]
    }

    #[inline]
    pub fn set(&mut self, element: Element, count: i32) {
        self.0[element.index()] = count;
    }

    /// Total number of atoms.
    pub fn atom_count(&self) -> i64 {
        self.0.iter().map(|&c| c as i64).sum()
    }

    /// Calculate the monoisotopic mass of the formula.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::formula::Formula;
    ///
    /// let glucose: Formula = "C6H12O6".parse().unwrap();
    /// assert!((glucose.monoisotopic_mass() - 180.06339).abs() < 1e-5);
    /// ```
    pub fn monoisotopic_mass(&self) -> f64 {
        self.0
            .iter()
            .zip(ATOMIC_MASSES.iter())
            .fold(0.0, |acc, (&count, &mass)| acc + count as f64 * mass)
    }

    /// Degree of unsaturation, `1 + sum(count * (valence - 2)) / 2`.
    ///
    /// The value is not rounded, odd-electron compositions give half-integers.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::formula::Formula;
    ///
    /// let benzene: Formula = "C6H6".parse().unwrap();
    /// assert_eq!(benzene.dbe(), 4.0);
    /// ```
    pub fn dbe(&self) -> f64 {
        let weighted: i64 = self
            .0
            .iter()
            .zip(VALENCES.iter())
            .map(|(&count, &valence)| count as i64 * (valence as i64 - 2))
            .sum();
        1.0 + weighted as f64 / 2.0
    }

    /// `true` if every element count is at most the count in `other`.
    #[inline]
    pub fn is_subset_of(&self, other: &Formula) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a <= b)
    }

    /// `true` if every element count lies inside `[min, max]`.
    #[inline]
    pub fn within(&self, min: &Formula, max: &Formula) -> bool {
        min.is_subset_of(self) && self.is_subset_of(max)
    }

    /// Element-wise minimum of two formulas.
    pub fn element_min(&self, other: &Formula) -> Formula {
        let mut result = *self;
        for (r, &o) in result.0.iter_mut().zip(other.0.iter()) {
            *r = (*r).min(o);
        }
        result
    }

    /// Element-wise difference, `None` if `other` is not a subset of `self`.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::formula::Formula;
    ///
    /// let glucose: Formula = "C6H12O6".parse().unwrap();
    /// let fragment: Formula = "C6H10O5".parse().unwrap();
    /// assert_eq!(glucose.checked_sub(&fragment).unwrap().to_string(), "H2O");
    /// assert!(fragment.checked_sub(&glucose).is_none());
    /// ```
    pub fn checked_sub(&self, other: &Formula) -> Option<Formula> {
        if !other.is_subset_of(self) {
            return None;
        }
        let mut result = *self;
        for (r, &o) in result.0.iter_mut().zip(other.0.iter()) {
            *r -= o;
        }
        Some(result)
    }

    /// Bitmask of the elements whose count is non-zero.
    pub fn element_mask(&self) -> u16 {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .fold(0u16, |mask, (i, _)| mask | (1 << i))
    }
}

impl Index<Element> for Formula {
    type Output = i32;

    fn index(&self, element: Element) -> &i32 {
        &self.0[element.index()]
    }
}

impl IndexMut<Element> for Formula {
    fn index_mut(&mut self, element: Element) -> &mut i32 {
        &mut self.0[element.index()]
    }
}

impl From<[i32; NUM_ELEMENTS]> for Formula {
    fn from(counts: [i32; NUM_ELEMENTS]) -> Self {
        Formula(counts)
    }
}

// Hill system: C, then H, then the rest alphabetically. Without carbon every
// element is alphabetical.
const HILL_ORDER_WITH_CARBON: [Element; NUM_ELEMENTS] = [
    Element::C, Element::H, Element::As, Element::B, Element::Br,
    Element::Cl, Element::F, Element::I, Element::K, Element::N,
    Element::Na, Element::O, Element::P, Element::S, Element::Si,
];

const ALPHABETICAL_ORDER: [Element; NUM_ELEMENTS] = [
    Element::As, Element::B, Element::Br, Element::C, Element::Cl,
    Element::F, Element::H, Element::I, Element::K, Element::N,
    Element::Na, Element::O, Element::P, Element::S, Element::Si,
];

impl Display for Formula {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let order = if self.get(Element::C) > 0 {
            &HILL_ORDER_WITH_CARBON
        } else {
            &ALPHABETICAL_ORDER
        };
        for &element in order {
            match self.get(element) {
                0 => {}
                1 => write!(f, "{}", element)?,
                count => write!(f, "{}{}", element, count)?,
            }
        }
        Ok(())
    }
}

fn formula_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"([A-Z][a-z]?)(\d*)").expect("formula token pattern compiles"))
}

/// Parse a chemical formula such as `C6H12O6` into a `Formula`.
///
/// Repeated symbols accumulate (`CH3CH3` is `C2H6`), symbols outside the
/// supported element set and stray characters are rejected.
///
/// # Example
///
/// ```
/// use msdecomp::chemistry::elements::Element;
/// use msdecomp::chemistry::formula::parse_formula;
///
/// let formula = parse_formula("CH3CH2Cl").unwrap();
/// assert_eq!(formula[Element::C], 2);
/// assert_eq!(formula[Element::H], 5);
/// assert_eq!(formula[Element::Cl], 1);
/// assert!(parse_formula("C6Se").is_err());
/// ```
pub fn parse_formula(formula: &str) -> Result<Formula, DecompositionError> {
    let formula = formula.trim();
    if formula.is_empty() {
        return Err(DecompositionError::FormulaParse("empty formula".to_string()));
    }

    let mut result = Formula::zeros();
    let mut position = 0;

    for captures in formula_token().captures_iter(formula) {
        let token = captures.get(0).map_or(position..position, |m| m.range());
        if token.start != position {
            return Err(DecompositionError::FormulaParse(format!(
                "unexpected '{}' in {}",
                &formula[position..token.start],
                formula
            )));
        }
        position = token.end;

        let symbol = &captures[1];
        let element = Element::from_symbol(symbol)
            .ok_or_else(|| DecompositionError::FormulaParse(format!("unknown element: {}", symbol)))?;
        let count = match &captures[2] {
            "" => 1,
            digits => digits
                .parse::<i32>()
                .map_err(|_| DecompositionError::FormulaParse(format!("count out of range: {}{}", symbol, digits)))?,
        };
        result[element] = result[element]
            .checked_add(count)
            .ok_or_else(|| DecompositionError::FormulaParse(format!("count out of range for {}", symbol)))?;
    }

    if position != formula.len() {
        return Err(DecompositionError::FormulaParse(format!(
            "unexpected '{}' in {}",
            &formula[position..],
            formula
        )));
    }

    Ok(result)
}

impl FromStr for Formula {
    type Err = DecompositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_formula(s)
    }
}
