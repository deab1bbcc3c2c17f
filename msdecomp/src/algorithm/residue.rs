//! Integer lattice preprocessing for mass decomposition.
//!
//! Real atomic masses are scaled to integers with a fixed precision, reduced by
//! their common divisor, and an Extended Residue Table (ERT) is built with the
//! round-robin algorithm of Böcker and Lipták. For the smallest integer mass
//! `a1` of the alphabet, `ert[j][r]` holds the smallest integer mass with
//! residue `r` modulo `a1` that can be written with the first `j + 1`
//! elements (ascending integer mass). An integer mass `m` is decomposable over
//! the first `j + 1` elements iff `ert[j][m mod a1] <= m`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::chemistry::elements::{Element, NUM_ELEMENTS};
use crate::chemistry::formula::Formula;
use crate::error::{DecompositionError, Result};

/// Default mass per integer unit in Dalton.
pub const DEFAULT_PRECISION: f64 = 1e-5;

/// Largest residue table (rows) a decomposer will allocate.
pub const MAX_RESIDUE_ROWS: i64 = 1 << 27;

const INFINITE: i64 = i64::MAX;

/// One element of a search alphabet, with the bounds of the decomposer using it.
#[derive(Clone, Debug, PartialEq)]
pub struct Weight {
    pub element: Element,
    pub mass: f64,
    pub integer_mass: i64,
    pub min_count: i32,
    pub max_count: i32,
}

impl Weight {
    /// Number of atoms the search may add on top of `min_count`.
    #[inline]
    pub fn range(&self) -> i32 {
        self.max_count - self.min_count
    }
}

/// Bitmask of the elements whose count is free to vary between the bounds.
pub fn alphabet_mask(min_bounds: &Formula, max_bounds: &Formula) -> u16 {
    let mut free = Formula::zeros();
    for element in Element::ALL {
        free[element] = (max_bounds[element] - min_bounds[element]).max(0);
    }
    free.element_mask()
}

/// Fail fast if the heaviest bounded composition cannot be represented as an
/// integer mass at `precision`.
pub fn check_integer_range(min_bounds: &Formula, max_bounds: &Formula, precision: f64) -> Result<()> {
    if !(precision.is_finite() && precision > 0.0) {
        return Err(DecompositionError::InvalidPrecision(precision));
    }
    let mut total = 0.0;
    for element in Element::ALL {
        let range = (max_bounds[element] - min_bounds[element]).max(0) as f64;
        total += range * (element.monoisotopic_mass() / precision).round();
        if total >= i64::MAX as f64 {
            return Err(DecompositionError::NumericOverflow { element });
        }
    }
    Ok(())
}

pub fn gcd(mut u: i64, mut v: i64) -> i64 {
    while v != 0 {
        let r = u % v;
        u = v;
        v = r;
    }
    u.abs()
}

/// Discretized alphabet plus its Extended Residue Table.
///
/// The table only depends on which elements take part and on the precision,
/// never on the element bounds, so decomposers with the same alphabet share
/// one instance.
#[derive(Debug)]
pub struct ResidueTable {
    mask: u16,
    elements: Vec<Element>,
    integer_masses: Vec<i64>,
    precision: f64,
    min_error: f64,
    max_error: f64,
    // column-major, ert[j * rows + r]
    ert: Vec<i64>,
    rows: usize,
}

impl ResidueTable {
    pub fn new(mask: u16, precision: f64) -> Result<Self> {
        if !(precision.is_finite() && precision > 0.0) {
            return Err(DecompositionError::InvalidPrecision(precision));
        }

        let elements: Vec<Element> = Element::ALL
            .iter()
            .copied()
            .filter(|e| mask & (1 << e.index()) != 0)
            .collect();

        let mut table = ResidueTable {
            mask,
            elements,
            integer_masses: Vec::new(),
            precision,
            min_error: 0.0,
            max_error: 0.0,
            ert: Vec::new(),
            rows: 0,
        };

        if table.elements.is_empty() {
            return Ok(table);
        }

        table.discretize_masses()?;
        table.divide_by_gcd();
        table.compute_errors();
        table.calc_ert()?;

        debug!(
            elements = table.elements.len(),
            rows = table.rows,
            precision = table.precision,
            "built extended residue table"
        );

        Ok(table)
    }

    fn discretize_masses(&mut self) -> Result<()> {
        let mut scaled = Vec::with_capacity(self.elements.len());
        for &element in &self.elements {
            let value = (element.monoisotopic_mass() / self.precision).round();
            if value >= i64::MAX as f64 {
                return Err(DecompositionError::NumericOverflow { element });
            }
            if value < 1.0 {
                return Err(DecompositionError::InvalidPrecision(self.precision));
            }
            scaled.push((element, value as i64));
        }
        // ascending integer mass, the smallest one defines the residue classes
        scaled.sort_by_key(|&(element, integer_mass)| (integer_mass, element));
        self.elements = scaled.iter().map(|&(e, _)| e).collect();
        self.integer_masses = scaled.iter().map(|&(_, m)| m).collect();
        Ok(())
    }

    fn divide_by_gcd(&mut self) {
        let mut d = self.integer_masses[0];
        for &m in &self.integer_masses[1..] {
            d = gcd(d, m);
            if d == 1 {
                return;
            }
        }
        if d > 1 {
            trace!(divisor = d, "reducing integer masses");
            self.precision *= d as f64;
            for m in self.integer_masses.iter_mut() {
                *m /= d;
            }
        }
    }

    fn compute_errors(&mut self) {
        self.min_error = 0.0;
        self.max_error = 0.0;
        for (element, &integer_mass) in self.elements.iter().zip(self.integer_masses.iter()) {
            let mass = element.monoisotopic_mass();
            let error = (self.precision * integer_mass as f64 - mass) / mass;
            self.min_error = self.min_error.min(error);
            self.max_error = self.max_error.max(error);
        }
    }

    fn calc_ert(&mut self) -> Result<()> {
        let a1 = self.integer_masses[0];
        if a1 > MAX_RESIDUE_ROWS {
            return Err(DecompositionError::ResidueTableTooLarge { rows: a1 });
        }
        let rows = usize::try_from(a1).map_err(|_| DecompositionError::NumericOverflow { element: self.elements[0] })?;
        let columns = self.elements.len();
        let size = rows
            .checked_mul(columns)
            .ok_or(DecompositionError::NumericOverflow { element: self.elements[0] })?;

        let mut ert = vec![INFINITE; size];
        // first column: only multiples of a1
        ert[0] = 0;

        for j in 1..columns {
            let (done, rest) = ert.split_at_mut(j * rows);
            let previous = &done[(j - 1) * rows..];
            let current = &mut rest[..rows];
            let weight = self.integer_masses[j];
            let d = gcd(a1, weight);

            current[0] = 0;

            // one round robin walk per residue class modulo gcd(a1, weight)
            for p in 0..d {
                let mut n = if p == 0 {
                    0
                } else {
                    let (argmin, min) = (p..a1)
                        .step_by(d as usize)
                        .map(|i| (i as usize, previous[i as usize]))
                        .min_by_key(|&(_, value)| value)
                        .unwrap_or((p as usize, INFINITE));
                    current[argmin] = min;
                    min
                };

                if n == INFINITE {
                    for i in (p..a1).step_by(d as usize) {
                        current[i as usize] = INFINITE;
                    }
                    continue;
                }

                for _ in 1..(a1 / d) {
                    n = n
                        .checked_add(weight)
                        .ok_or(DecompositionError::NumericOverflow { element: self.elements[j] })?;
                    let r = (n % a1) as usize;
                    if previous[r] < n {
                        n = previous[r];
                    }
                    current[r] = n;
                }
            }
        }

        self.ert = ert;
        self.rows = rows;
        Ok(())
    }

    /// Can integer mass `m` be written with the first `i + 1` alphabet elements?
    #[inline]
    pub fn decomposable(&self, i: usize, m: i64) -> bool {
        if m < 0 {
            return false;
        }
        if self.elements.is_empty() {
            return m == 0;
        }
        let r = (m % self.integer_masses[0]) as usize;
        self.ert[i * self.rows + r] <= m
    }

    /// Decomposability over the whole alphabet.
    #[inline]
    pub fn decomposable_fast(&self, m: i64) -> bool {
        match self.elements.len() {
            0 => m == 0,
            k => self.decomposable(k - 1, m),
        }
    }

    /// Inclusive integer window covering every integer mass whose real mass
    /// can fall inside `[mass_from, mass_to]`.
    ///
    /// The window is widened by one unit on each side to absorb floating point
    /// rounding; callers must verify real masses afterwards.
    pub fn integer_bound(&self, mass_from: f64, mass_to: f64) -> Option<(i64, i64)> {
        if !(mass_to >= 0.0) || mass_from > mass_to {
            return None;
        }
        let from = ((1.0 + self.min_error) * mass_from / self.precision).ceil() - 1.0;
        let to = ((1.0 + self.max_error) * mass_to / self.precision).floor() + 1.0;
        // float to int casts saturate
        let start = (from as i64).max(0);
        let end = to as i64;
        (end >= start).then_some((start, end))
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Alphabet in table order (ascending integer mass).
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn integer_masses(&self) -> &[i64] {
        &self.integer_masses
    }

    /// Mass per integer unit after the gcd reduction.
    pub fn precision(&self) -> f64 {
        self.precision
    }

    pub fn min_error(&self) -> f64 {
        self.min_error
    }

    pub fn max_error(&self) -> f64 {
        self.max_error
    }
}

/// Memoizes residue tables per (alphabet, precision).
///
/// Not synchronized: fill it before handing tables to worker threads.
#[derive(Debug, Default)]
pub struct ResidueTableCache {
    tables: HashMap<(u16, u64), Arc<ResidueTable>>,
}

impl ResidueTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing table under the precision it was requested with.
    ///
    /// The table's own `precision()` may differ after the gcd reduction.
    pub fn insert(&mut self, requested_precision: f64, table: Arc<ResidueTable>) {
        self.tables.insert((table.mask(), requested_precision.to_bits()), table);
    }

    /// Table for `mask` at `precision`.
    ///
    /// A cached table over a superset of `mask` is returned as is, it prunes
    /// the smaller alphabet correctly. Only when no such table exists a new
    /// one is built.
    pub fn get_or_build(&mut self, mask: u16, precision: f64) -> Result<Arc<ResidueTable>> {
        let key = (mask, precision.to_bits());
        if let Some(table) = self.tables.get(&key) {
            return Ok(Arc::clone(table));
        }
        if let Some(table) = self.superset(mask, precision) {
            return Ok(table);
        }
        let table = Arc::new(ResidueTable::new(mask, precision)?);
        self.tables.insert(key, Arc::clone(&table));
        Ok(table)
    }

    fn superset(&self, mask: u16, precision: f64) -> Option<Arc<ResidueTable>> {
        self.tables
            .iter()
            .filter(|((m, p), _)| *p == precision.to_bits() && m & mask == mask)
            .min_by_key(|((m, _), _)| (m.count_ones(), *m))
            .map(|(_, table)| Arc::clone(table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Mask with every element set.
pub const FULL_MASK: u16 = (1 << NUM_ELEMENTS) - 1;
