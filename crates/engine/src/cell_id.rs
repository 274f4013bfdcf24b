//! Cell coordinates and document extents.
//!
//! A `Coord` is a 0-based (row, col) pair. The derived ordering is row-major,
//! which is the tie-break order used everywhere a deterministic cell order is
//! needed (recalculation, snapshots, persistence).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a cell in a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    /// Row index (0-based)
    pub row: usize,
    /// Column index (0-based)
    pub col: usize,
}

impl Coord {
    #[inline]
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Parse an A1-style reference (`A1`, `$B$7`, `aa10`).
    ///
    /// Returns `None` for anything that is not letters followed by a 1-based row.
    pub fn parse_a1(s: &str) -> Option<Self> {
        let s = s.trim();
        let bytes = s.as_bytes();
        let mut i = 0;

        if bytes.get(i) == Some(&b'$') {
            i += 1;
        }
        let letters_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let letters = &s[letters_start..i];
        if letters.is_empty() {
            return None;
        }
        if bytes.get(i) == Some(&b'$') {
            i += 1;
        }
        let digits = &s[i..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let row: usize = digits.parse().ok()?;
        if row == 0 {
            return None;
        }
        let col = letters_to_col(letters)?;
        Some(Self { row: row - 1, col })
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", col_to_letters(self.col), self.row + 1)
    }
}

/// Dimensions of a document grid: valid coordinates are `row < rows`, `col < cols`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub rows: usize,
    pub cols: usize,
}

impl Extent {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    #[inline]
    pub fn contains(&self, coord: Coord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    /// True if `other` fits inside this extent in both dimensions.
    pub fn covers(&self, other: Extent) -> bool {
        other.rows <= self.rows && other.cols <= self.cols
    }

    /// Number of cells in the grid.
    pub fn area(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Convert 0-based column index to Excel-style letter(s).
pub fn col_to_letters(col: usize) -> String {
    let mut result = String::new();
    let mut n = col;
    loop {
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    result
}

/// Convert Excel-style column letters (case-insensitive) to a 0-based index.
pub fn letters_to_col(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut col: usize = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        col = col.checked_mul(26)?.checked_add(digit)?;
    }
    Some(col - 1)
}
