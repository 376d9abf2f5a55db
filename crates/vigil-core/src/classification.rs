//! Violation pressure classes.
//!
//! The boundaries are fixed at compile time. A value sitting exactly on a
//! boundary belongs to the higher class.

use serde::{Deserialize, Serialize};

/// Lower bound of VP1.
pub const VP1_BOUNDARY: f64 = 0.25;
/// Lower bound of VP2.
pub const VP2_BOUNDARY: f64 = 0.50;
/// Lower bound of VP3.
pub const VP3_BOUNDARY: f64 = 0.75;
/// Lower bound of VP4.
pub const VP4_BOUNDARY: f64 = 1.00;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum VpClass {
    #[serde(rename = "VP0")]
    Vp0,
    #[serde(rename = "VP1")]
    Vp1,
    #[serde(rename = "VP2")]
    Vp2,
    #[serde(rename = "VP3")]
    Vp3,
    #[serde(rename = "VP4")]
    Vp4,
}

impl VpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vp0 => "VP0",
            Self::Vp1 => "VP1",
            Self::Vp2 => "VP2",
            Self::Vp3 => "VP3",
            Self::Vp4 => "VP4",
        }
    }

    /// Inclusive lower bound of this class.
    pub fn lower_bound(&self) -> f64 {
        match self {
            Self::Vp0 => 0.0,
            Self::Vp1 => VP1_BOUNDARY,
            Self::Vp2 => VP2_BOUNDARY,
            Self::Vp3 => VP3_BOUNDARY,
            Self::Vp4 => VP4_BOUNDARY,
        }
    }

    pub fn is_critical(&self) -> bool {
        *self >= Self::Vp3
    }
}

impl std::fmt::Display for VpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket a violation pressure. NaN is treated as maximal pressure.
pub fn classify(vp: f64) -> VpClass {
    if vp.is_nan() || vp >= VP4_BOUNDARY {
        VpClass::Vp4
    } else if vp >= VP3_BOUNDARY {
        VpClass::Vp3
    } else if vp >= VP2_BOUNDARY {
        VpClass::Vp2
    } else if vp >= VP1_BOUNDARY {
        VpClass::Vp1
    } else {
        VpClass::Vp0
    }
}
