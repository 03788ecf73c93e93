//! Rack positions and tip bookkeeping.
//!
//! Operators count rack slots 1..N left to right, top to bottom. The arm
//! programs expect `row * 10 + col`, both 1-based.

use serde::{Deserialize, Serialize};

use crate::error::StationError;

/// Rack types on the dispensing station and their column counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rack {
    /// Powder hoppers.
    Solid,
    /// 15 mL tubes.
    Tube,
    /// Liquid beakers.
    Liquid,
    /// Pipette tips.
    Tip,
}

impl Rack {
    pub fn columns(self) -> i64 {
        match self {
            Rack::Solid | Rack::Tube => 6,
            Rack::Liquid => 2,
            Rack::Tip => 8,
        }
    }

    pub fn physical(self, logical: i64) -> Result<i64, StationError> {
        map_to_grid(logical, self.columns())
    }
}

/// Map a 1-based logical slot to `row * 10 + col`.
pub fn map_to_grid(logical: i64, cols: i64) -> Result<i64, StationError> {
    if logical <= 0 || cols <= 0 {
        return Err(StationError::InvalidPosition(logical));
    }
    let row = (logical - 1) / cols + 1;
    let col = (logical - 1) % cols + 1;
    Ok(row * 10 + col)
}

/// Tip availability flags, 1 = available, 0 = used. Tips are always taken
/// from the left and a used tip is never handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TipInventory(Vec<u8>);

impl TipInventory {
    pub fn new(flags: Vec<u8>) -> Self {
        Self(flags)
    }

    pub fn available(&self) -> usize {
        self.0.iter().filter(|f| **f != 0).count()
    }

    /// Take the first available tip and return its 1-based position.
    pub fn take(&mut self) -> Result<i64, StationError> {
        let index = self
            .0
            .iter()
            .position(|f| *f != 0)
            .ok_or(StationError::NoTipsAvailable)?;
        self.0[index] = 0;
        Ok(index as i64 + 1)
    }

    pub fn flags(&self) -> &[u8] {
        &self.0
    }

    pub fn into_flags(self) -> Vec<u8> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_column_rows() {
        let mapped: Vec<i64> = (1..=7).map(|p| map_to_grid(p, 6).unwrap()).collect();
        assert_eq!(mapped, vec![11, 12, 13, 14, 15, 16, 21]);
        assert_eq!(Rack::Liquid.physical(3).unwrap(), 21);
        assert_eq!(Rack::Tip.physical(9).unwrap(), 21);
    }

    #[test]
    fn non_positive_positions_are_rejected() {
        assert!(matches!(map_to_grid(0, 6), Err(StationError::InvalidPosition(0))));
        assert!(matches!(map_to_grid(-3, 2), Err(StationError::InvalidPosition(-3))));
    }

    #[test]
    fn tips_are_consumed_left_to_right() {
        let mut tips = TipInventory::new(vec![1, 1, 0, 1]);
        assert_eq!(tips.take().unwrap(), 1);
        assert_eq!(tips.take().unwrap(), 2);
        assert_eq!(tips.flags(), &[0, 0, 0, 1]);
        assert_eq!(tips.take().unwrap(), 4);
        assert!(matches!(tips.take(), Err(StationError::NoTipsAvailable)));
    }
}
