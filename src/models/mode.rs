use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation mode of a caster interface.
///
/// `Testing` drives the valves without any machine synchronization and is
/// always available; `Casting` and `Punching` have to be listed in the
/// interface's supported modes.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[display(fmt = "casting")]
    Casting,
    #[display(fmt = "punching")]
    Punching,
    #[display(fmt = "testing")]
    Testing,
}

/// Row 16 addressing mode. Absence of a mode means plain addressing,
/// where row 16 collapses into row 15.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Row16Mode {
    #[display(fmt = "HMN")]
    #[serde(rename = "HMN")]
    Hmn,
    #[display(fmt = "KMN")]
    #[serde(rename = "KMN")]
    Kmn,
    #[display(fmt = "unit shift")]
    #[serde(rename = "unit shift")]
    UnitShift,
}

#[derive(Error, Debug)]
#[error("unknown operation mode: {0}")]
pub struct UnknownMode(pub String);

#[derive(Error, Debug)]
#[error("unknown row 16 mode: {0}")]
pub struct UnknownRow16Mode(pub String);

impl FromStr for OperationMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "casting" => Ok(Self::Casting),
            "punching" => Ok(Self::Punching),
            "testing" => Ok(Self::Testing),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

impl FromStr for Row16Mode {
    type Err = UnknownRow16Mode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hmn" => Ok(Self::Hmn),
            "kmn" => Ok(Self::Kmn),
            "unit shift" | "unit-shift" | "unit_shift" | "unitshift" => Ok(Self::UnitShift),
            _ => Err(UnknownRow16Mode(s.to_string())),
        }
    }
}

/// A mode change requested over the API. `Reset` reverts to the configured
/// default; the magic "reset" string only exists at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Reset,
    Set(OperationMode),
}

impl ModeRequest {
    /// Parse a request body value. A JSON `null` selects testing.
    pub fn parse(raw: Option<&str>) -> Result<Self, UnknownMode> {
        match raw {
            None => Ok(Self::Set(OperationMode::Testing)),
            Some(s) if s.trim().eq_ignore_ascii_case("reset") => Ok(Self::Reset),
            Some(s) => Ok(Self::Set(s.parse()?)),
        }
    }
}

/// A row 16 mode change requested over the API. A JSON `null` turns the
/// attachment off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Row16Request {
    Reset,
    Set(Option<Row16Mode>),
}

impl Row16Request {
    pub fn parse(raw: Option<&str>) -> Result<Self, UnknownRow16Mode> {
        match raw {
            None => Ok(Self::Set(None)),
            Some(s) if s.trim().eq_ignore_ascii_case("reset") => Ok(Self::Reset),
            Some(s) => Ok(Self::Set(Some(s.parse()?))),
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    #[test]
    fn test_parse_operation_mode() {
        assert_eq!("casting".parse::<OperationMode>().unwrap(), OperationMode::Casting);
        assert_eq!(" Punching ".parse::<OperationMode>().unwrap(), OperationMode::Punching);
        assert!("perforating".parse::<OperationMode>().is_err());
    }

    #[test]
    fn test_parse_row16_mode() {
        assert_eq!("HMN".parse::<Row16Mode>().unwrap(), Row16Mode::Hmn);
        assert_eq!("kmn".parse::<Row16Mode>().unwrap(), Row16Mode::Kmn);
        assert_eq!("unit shift".parse::<Row16Mode>().unwrap(), Row16Mode::UnitShift);
        assert_eq!("unit-shift".parse::<Row16Mode>().unwrap(), Row16Mode::UnitShift);
        assert!("HMM".parse::<Row16Mode>().is_err());
    }

    #[test]
    fn test_mode_request_boundary_values() {
        assert_eq!(ModeRequest::parse(None).unwrap(), ModeRequest::Set(OperationMode::Testing));
        assert_eq!(ModeRequest::parse(Some("reset")).unwrap(), ModeRequest::Reset);
        assert_eq!(
            ModeRequest::parse(Some("casting")).unwrap(),
            ModeRequest::Set(OperationMode::Casting)
        );
        assert!(ModeRequest::parse(Some("garbage")).is_err());
    }

    #[test]
    fn test_row16_request_boundary_values() {
        assert_eq!(Row16Request::parse(None).unwrap(), Row16Request::Set(None));
        assert_eq!(Row16Request::parse(Some("reset")).unwrap(), Row16Request::Reset);
        assert_eq!(
            Row16Request::parse(Some("unit shift")).unwrap(),
            Row16Request::Set(Some(Row16Mode::UnitShift))
        );
        assert!(Row16Request::parse(Some("ABC")).is_err());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&OperationMode::Casting).unwrap(), "\"casting\"");
        assert_eq!(serde_json::to_string(&Row16Mode::UnitShift).unwrap(), "\"unit shift\"");
        assert_eq!(serde_json::to_string(&Row16Mode::Hmn).unwrap(), "\"HMN\"");
    }
}
