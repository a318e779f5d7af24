use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image acquisition type; selects the TotalSegmentator task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Ct,
    Mr,
}

impl Modality {
    pub fn task(&self) -> &'static str {
        match self {
            Modality::Ct => "total",
            Modality::Mr => "total_mr",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Ct => "CT",
            Modality::Mr => "MR",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CT" => Ok(Modality::Ct),
            "MR" => Ok(Modality::Mr),
            _ => Err(format!("Invalid image_type '{}': expected CT or MR", s.trim())),
        }
    }
}
