//! Bravais lattices, unit cells and the ranked list of indexing solutions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fourteen Bravais lattices, by their two-letter symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lattice {
    #[serde(rename = "aP")]
    TriclinicP,
    #[serde(rename = "mP")]
    MonoclinicP,
    #[serde(rename = "mC")]
    MonoclinicC,
    #[serde(rename = "oP")]
    OrthorhombicP,
    #[serde(rename = "oC")]
    OrthorhombicC,
    #[serde(rename = "oF")]
    OrthorhombicF,
    #[serde(rename = "oI")]
    OrthorhombicI,
    #[serde(rename = "tP")]
    TetragonalP,
    #[serde(rename = "tI")]
    TetragonalI,
    #[serde(rename = "hP")]
    HexagonalP,
    #[serde(rename = "hR")]
    HexagonalR,
    #[serde(rename = "cP")]
    CubicP,
    #[serde(rename = "cF")]
    CubicF,
    #[serde(rename = "cI")]
    CubicI,
}

impl Lattice {
    pub const ALL: [Lattice; 14] = [
        Lattice::TriclinicP,
        Lattice::MonoclinicP,
        Lattice::MonoclinicC,
        Lattice::OrthorhombicP,
        Lattice::OrthorhombicC,
        Lattice::OrthorhombicF,
        Lattice::OrthorhombicI,
        Lattice::TetragonalP,
        Lattice::TetragonalI,
        Lattice::HexagonalP,
        Lattice::HexagonalR,
        Lattice::CubicP,
        Lattice::CubicF,
        Lattice::CubicI,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Lattice::TriclinicP => "aP",
            Lattice::MonoclinicP => "mP",
            Lattice::MonoclinicC => "mC",
            Lattice::OrthorhombicP => "oP",
            Lattice::OrthorhombicC => "oC",
            Lattice::OrthorhombicF => "oF",
            Lattice::OrthorhombicI => "oI",
            Lattice::TetragonalP => "tP",
            Lattice::TetragonalI => "tI",
            Lattice::HexagonalP => "hP",
            Lattice::HexagonalR => "hR",
            Lattice::CubicP => "cP",
            Lattice::CubicF => "cF",
            Lattice::CubicI => "cI",
        }
    }

    /// Lowest-numbered space group with this lattice. Higher means more
    /// symmetric, which is the order solutions are tried in.
    pub fn spacegroup_number(&self) -> u32 {
        match self {
            Lattice::TriclinicP => 1,
            Lattice::MonoclinicP => 3,
            Lattice::MonoclinicC => 5,
            Lattice::OrthorhombicP => 16,
            Lattice::OrthorhombicC => 20,
            Lattice::OrthorhombicF => 22,
            Lattice::OrthorhombicI => 23,
            Lattice::TetragonalP => 75,
            Lattice::TetragonalI => 79,
            Lattice::HexagonalP => 143,
            Lattice::HexagonalR => 146,
            Lattice::CubicP => 195,
            Lattice::CubicF => 196,
            Lattice::CubicI => 197,
        }
    }

    /// Crystal system letter (`a`, `m`, `o`, `t`, `h`, `c`).
    pub fn system(&self) -> char {
        self.symbol().chars().next().unwrap_or('a')
    }

    /// Lattice of a Hermann-Mauguin space group symbol such as `P 41 21 2`.
    pub fn from_spacegroup_symbol(symbol: &str) -> Result<Lattice> {
        let mut tokens = symbol.split_whitespace();
        let centring = tokens
            .next()
            .and_then(|t| t.chars().next())
            .ok_or_else(|| Error::BadSpacegroup(symbol.to_string()))?;
        let axes: Vec<&str> = tokens.filter(|t| *t != "1").collect();

        let system = if axes.iter().any(|t| t.starts_with('6') || t.starts_with("-6"))
            || axes.first().is_some_and(|t| t.starts_with('3') || t.starts_with("-3"))
        {
            'h'
        } else if axes.get(1).is_some_and(|t| *t == "3" || *t == "-3") {
            'c'
        } else if axes.first().is_some_and(|t| t.starts_with('4') || t.starts_with("-4")) {
            't'
        } else if axes.len() >= 2 {
            'o'
        } else if axes.len() == 1 {
            'm'
        } else {
            'a'
        };

        let centring = match (system, centring) {
            ('h', 'R') => 'R',
            ('h', _) => 'P',
            ('m' | 'o', 'A' | 'B' | 'C') => 'C',
            (_, c) => c,
        };
        format!("{system}{centring}")
            .parse()
            .map_err(|_| Error::BadSpacegroup(symbol.to_string()))
    }
}

impl fmt::Display for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Lattice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Lattice::ALL
            .iter()
            .find(|l| l.symbol() == s)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown lattice {s}")))
    }
}

/// Unit cell constants: lengths in Angstrom, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 6]", into = "[f64; 6]")]
pub struct UnitCell {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl UnitCell {
    /// Build a cell, rejecting non-finite or non-positive constants.
    pub fn new(constants: [f64; 6]) -> Result<Self> {
        if constants.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(Error::InvalidArgument(format!(
                "invalid unit cell {constants:?}"
            )));
        }
        if constants[3..].iter().any(|v| *v >= 180.0) {
            return Err(Error::InvalidArgument(format!(
                "invalid unit cell angles {constants:?}"
            )));
        }
        let [a, b, c, alpha, beta, gamma] = constants;
        Ok(Self {
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
        })
    }

    pub fn constants(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
    }

    pub fn volume(&self) -> f64 {
        let (ca, cb, cg) = (
            self.alpha.to_radians().cos(),
            self.beta.to_radians().cos(),
            self.gamma.to_radians().cos(),
        );
        let root = 1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg;
        self.a * self.b * self.c * root.max(0.0).sqrt()
    }

    /// Fractional volume change from `self` to `other`.
    pub fn volume_change(&self, other: &UnitCell) -> f64 {
        let before = self.volume();
        (other.volume() - before).abs() / before
    }

    /// Whether the constants satisfy the metric constraints of `lattice`
    /// within `tolerance`.
    pub fn consistent_with(&self, lattice: Lattice, tolerance: f64) -> bool {
        let near = |x: f64, y: f64| (x - y).abs() <= tolerance;
        let right = |x: f64| near(x, 90.0);
        match lattice.system() {
            'a' => true,
            'm' => right(self.alpha) && right(self.gamma),
            'o' => right(self.alpha) && right(self.beta) && right(self.gamma),
            't' => {
                near(self.a, self.b) && right(self.alpha) && right(self.beta) && right(self.gamma)
            }
            'h' => {
                near(self.a, self.b)
                    && right(self.alpha)
                    && right(self.beta)
                    && near(self.gamma, 120.0)
            }
            'c' => {
                near(self.a, self.b)
                    && near(self.b, self.c)
                    && right(self.alpha)
                    && right(self.beta)
                    && right(self.gamma)
            }
            _ => false,
        }
    }
}

impl TryFrom<[f64; 6]> for UnitCell {
    type Error = Error;

    fn try_from(constants: [f64; 6]) -> Result<Self> {
        UnitCell::new(constants)
    }
}

impl From<UnitCell> for [f64; 6] {
    fn from(cell: UnitCell) -> Self {
        cell.constants()
    }
}

impl fmt::Display for UnitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} {:.2} {:.2} {:.2} {:.2} {:.2}",
            self.a, self.b, self.c, self.alpha, self.beta, self.gamma
        )
    }
}

/// One candidate produced by an indexing program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeSolution {
    pub lattice: Lattice,
    pub cell: UnitCell,
    /// Program-specific misfit; lower is better.
    pub penalty: f64,
}

/// Outcome of asserting a lattice against an indexer's solutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatticeAssertion {
    /// The indexer already uses this lattice.
    Correct,
    /// No remaining solution has this lattice.
    Impossible,
    /// Solutions above it were eliminated and the indexer must re-run.
    Possible,
}

/// Indexing solutions ordered highest symmetry first.
///
/// Only ever shrinks: `eliminate` drops the current best, and the last
/// solution can never be removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeSolutions {
    solutions: Vec<LatticeSolution>,
}

impl LatticeSolutions {
    pub fn new(mut solutions: Vec<LatticeSolution>) -> Result<Self> {
        if solutions.is_empty() {
            return Err(Error::NotEnoughLattices);
        }
        // Keep the best penalty per lattice
        solutions.sort_by(|a, b| {
            b.lattice
                .spacegroup_number()
                .cmp(&a.lattice.spacegroup_number())
                .then(a.penalty.total_cmp(&b.penalty))
        });
        solutions.dedup_by_key(|s| s.lattice);
        Ok(Self { solutions })
    }

    pub fn best(&self) -> &LatticeSolution {
        &self.solutions[0]
    }

    pub fn find(&self, lattice: Lattice) -> Option<&LatticeSolution> {
        self.solutions.iter().find(|s| s.lattice == lattice)
    }

    pub fn contains(&self, lattice: Lattice) -> bool {
        self.find(lattice).is_some()
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn lattices(&self) -> Vec<Lattice> {
        self.solutions.iter().map(|s| s.lattice).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LatticeSolution> {
        self.solutions.iter()
    }

    /// Drop the best solution.
    pub fn eliminate(&mut self) -> Result<&LatticeSolution> {
        if self.solutions.len() < 2 {
            return Err(Error::NotEnoughLattices);
        }
        self.solutions.remove(0);
        Ok(self.best())
    }

    /// Drop every solution ranked above `lattice`.
    pub fn eliminate_to(&mut self, lattice: Lattice) -> Result<&LatticeSolution> {
        let index = self
            .solutions
            .iter()
            .position(|s| s.lattice == lattice)
            .ok_or_else(|| Error::BadLattice(format!("{lattice} not among solutions")))?;
        self.solutions.drain(..index);
        Ok(self.best())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(c: [f64; 6]) -> UnitCell {
        UnitCell::new(c).unwrap()
    }

    fn solutions() -> LatticeSolutions {
        LatticeSolutions::new(vec![
            LatticeSolution {
                lattice: Lattice::TriclinicP,
                cell: cell([78.1, 78.0, 37.1, 90.0, 90.1, 89.9]),
                penalty: 0.0,
            },
            LatticeSolution {
                lattice: Lattice::TetragonalP,
                cell: cell([78.0, 78.0, 37.1, 90.0, 90.0, 90.0]),
                penalty: 1.2,
            },
            LatticeSolution {
                lattice: Lattice::OrthorhombicP,
                cell: cell([78.0, 78.1, 37.1, 90.0, 90.0, 90.0]),
                penalty: 0.8,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_lattice_symbols() {
        for lattice in Lattice::ALL {
            assert_eq!(lattice.symbol().parse::<Lattice>().unwrap(), lattice);
        }
        assert!("xQ".parse::<Lattice>().is_err());
    }

    #[test]
    fn test_from_spacegroup_symbol() {
        let cases = [
            ("P 1", Lattice::TriclinicP),
            ("P 1 21 1", Lattice::MonoclinicP),
            ("C 1 2 1", Lattice::MonoclinicC),
            ("P 21 21 21", Lattice::OrthorhombicP),
            ("C 2 2 21", Lattice::OrthorhombicC),
            ("I 2 2 2", Lattice::OrthorhombicI),
            ("P 41 21 2", Lattice::TetragonalP),
            ("I 4", Lattice::TetragonalI),
            ("P 31 2 1", Lattice::HexagonalP),
            ("P 61 2 2", Lattice::HexagonalP),
            ("R 3", Lattice::HexagonalR),
            ("P 2 3", Lattice::CubicP),
            ("F 4 3 2", Lattice::CubicF),
            ("I 21 3", Lattice::CubicI),
        ];
        for (symbol, lattice) in cases {
            assert_eq!(Lattice::from_spacegroup_symbol(symbol).unwrap(), lattice, "{symbol}");
        }
        assert!(Lattice::from_spacegroup_symbol("").is_err());
    }

    #[test]
    fn test_unit_cell_validation() {
        assert!(UnitCell::new([78.0, 78.0, 78.0, 90.0, 90.0, 90.0]).is_ok());
        assert!(UnitCell::new([78.0, f64::NAN, 78.0, 90.0, 90.0, 90.0]).is_err());
        assert!(UnitCell::new([78.0, 78.0, -1.0, 90.0, 90.0, 90.0]).is_err());
        assert!(serde_json::from_str::<UnitCell>("[1, 2, 3, 90, 90]").is_err());
    }

    #[test]
    fn test_volume() {
        let cubic = cell([10.0, 10.0, 10.0, 90.0, 90.0, 90.0]);
        assert!((cubic.volume() - 1000.0).abs() < 1e-9);
        let larger = cell([10.5, 10.0, 10.0, 90.0, 90.0, 90.0]);
        assert!((cubic.volume_change(&larger) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_consistent_with() {
        let tetragonal = cell([78.0, 78.0, 37.1, 90.0, 90.0, 90.0]);
        assert!(tetragonal.consistent_with(Lattice::TetragonalP, 0.5));
        assert!(tetragonal.consistent_with(Lattice::OrthorhombicP, 0.5));
        assert!(!tetragonal.consistent_with(Lattice::CubicP, 0.5));
        assert!(!tetragonal.consistent_with(Lattice::HexagonalP, 0.5));
    }

    #[test]
    fn test_solutions_sorted_by_symmetry() {
        let solutions = solutions();
        assert_eq!(
            solutions.lattices(),
            vec![Lattice::TetragonalP, Lattice::OrthorhombicP, Lattice::TriclinicP]
        );
        assert_eq!(solutions.best().lattice, Lattice::TetragonalP);
    }

    #[test]
    fn test_eliminate_until_exhausted() {
        let mut solutions = solutions();
        assert_eq!(solutions.eliminate().unwrap().lattice, Lattice::OrthorhombicP);
        assert_eq!(solutions.eliminate().unwrap().lattice, Lattice::TriclinicP);
        let err = solutions.eliminate().unwrap_err();
        assert_eq!(err.to_string(), "not enough lattices");
        assert_eq!(solutions.len(), 1);
    }

    #[test]
    fn test_eliminate_to() {
        let mut solutions = solutions();
        assert_eq!(
            solutions.eliminate_to(Lattice::TriclinicP).unwrap().lattice,
            Lattice::TriclinicP
        );
        assert!(solutions.eliminate_to(Lattice::CubicP).is_err());
    }
}
