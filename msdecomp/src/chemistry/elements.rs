use std::fmt::{self, Display, Formatter};

/// Number of elements a `Formula` can hold.
pub const NUM_ELEMENTS: usize = 15;

/// Element symbols, in formula slot order.
pub const ELEMENT_SYMBOLS: [&str; NUM_ELEMENTS] = [
    "H", "B", "C", "N", "O", "F", "Na", "Si", "P", "S", "Cl", "K", "As", "Br", "I",
];

/// Monoisotopic masses of the most abundant isotope of each element, in Dalton.
pub const ATOMIC_MASSES: [f64; NUM_ELEMENTS] = [
    1.007825, 11.009305, 12.000000, 14.003074, 15.994915, 18.998403,
    22.989770, 27.9769265, 30.973762, 31.972071, 34.96885271,
    38.963707, 74.921596, 78.918338, 126.904468,
];

/// Standard valences used for the degree of unsaturation.
pub const VALENCES: [i32; NUM_ELEMENTS] = [
    1, 3, 4, 3, 2, 1, 1, 4, 3, 2, 1, 1, 3, 1, 1,
];

/// The closed set of elements the decomposer works on.
///
/// The discriminant is the slot index of the element inside a `Formula`, so the
/// order of the variants is part of the serialized formula layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Element {
    H = 0,
    B = 1,
    C = 2,
    N = 3,
    O = 4,
    F = 5,
    Na = 6,
    Si = 7,
    P = 8,
    S = 9,
    Cl = 10,
    K = 11,
    As = 12,
    Br = 13,
    I = 14,
}

impl Element {
    /// All elements in slot order.
    pub const ALL: [Element; NUM_ELEMENTS] = [
        Element::H, Element::B, Element::C, Element::N, Element::O,
        Element::F, Element::Na, Element::Si, Element::P, Element::S,
        Element::Cl, Element::K, Element::As, Element::Br, Element::I,
    ];

    /// Slot index of the element inside a `Formula`.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Element for a slot index, `None` if out of range.
    pub fn from_index(index: usize) -> Option<Element> {
        Element::ALL.get(index).copied()
    }

    pub fn symbol(self) -> &'static str {
        ELEMENT_SYMBOLS[self.index()]
    }

    #[inline]
    pub fn monoisotopic_mass(self) -> f64 {
        ATOMIC_MASSES[self.index()]
    }

    #[inline]
    pub fn valence(self) -> i32 {
        VALENCES[self.index()]
    }

    /// Look up an element by its case-sensitive symbol.
    ///
    /// # Example
    ///
    /// ```
    /// use msdecomp::chemistry::elements::Element;
    ///
    /// assert_eq!(Element::from_symbol("Cl"), Some(Element::Cl));
    /// assert_eq!(Element::from_symbol("Se"), None);
    /// ```
    pub fn from_symbol(symbol: &str) -> Option<Element> {
        ELEMENT_SYMBOLS
            .iter()
            .position(|s| *s == symbol)
            .and_then(Element::from_index)
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}
