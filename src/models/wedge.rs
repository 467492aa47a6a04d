use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a justification wedge (0005 or 0075), limited to rows 1..=15.
/// Position 15 is the resting position: a combination without any row code
/// leaves the wedge there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct WedgePosition(u8);

#[derive(Error, Debug)]
pub enum WedgeError {
    #[error("wedge position {0} outside of 1..=15")]
    OutOfRange(u8),
}

impl WedgePosition {
    pub const MAX: WedgePosition = WedgePosition(15);

    pub fn get(self) -> u8 {
        self.0
    }

    /// The row signal selecting this position, e.g. "8".
    pub fn row_signal(self) -> String {
        self.0.to_string()
    }
}

impl TryFrom<u8> for WedgePosition {
    type Error = WedgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if !(1..=15).contains(&value) {
            return Err(WedgeError::OutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl From<WedgePosition> for u8 {
    fn from(value: WedgePosition) -> Self {
        value.0
    }
}

impl Default for WedgePosition {
    fn default() -> Self {
        Self::MAX
    }
}

impl Display for WedgePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
