//! Motor-record field identifiers and values.

pub mod bus;
pub mod synchronizer;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    axis::{state::CalibrationMode, AxisStateInfo},
    error::BridgeError,
    units::{Quantity, Unit},
};

pub use bus::{FieldBus, FieldStore};
pub use synchronizer::FieldSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    Settable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Float,
    Integer,
    Enum,
    Text,
}

/// What the field bus needs to expose one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub access: Access,
    pub field_type: FieldType,
    /// Values carry the axis unit, and writes may name a compatible one.
    pub unit_aware: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldId {
    Rrbv,
    Drbv,
    Rbv,
    Val,
    Dval,
    Rval,
    Rlv,
    Off,
    Set,
    Foff,
    Dhlm,
    Dllm,
    Hlm,
    Llm,
    Velo,
    Accl,
    Bdst,
    Dir,
    Homf,
    Homr,
    Stop,
    Spmg,
    Movn,
    Dmov,
    Hls,
    Lls,
    Rhls,
    Rlls,
    Diff,
    Rdif,
    Egu,
    Mres,
    Homed,
    Trng,
    Phase,
    Alarm,
}

impl FieldId {
    pub const ALL: [FieldId; 36] = [
        FieldId::Rrbv,
        FieldId::Drbv,
        FieldId::Rbv,
        FieldId::Val,
        FieldId::Dval,
        FieldId::Rval,
        FieldId::Rlv,
        FieldId::Off,
        FieldId::Set,
        FieldId::Foff,
        FieldId::Dhlm,
        FieldId::Dllm,
        FieldId::Hlm,
        FieldId::Llm,
        FieldId::Velo,
        FieldId::Accl,
        FieldId::Bdst,
        FieldId::Dir,
        FieldId::Homf,
        FieldId::Homr,
        FieldId::Stop,
        FieldId::Spmg,
        FieldId::Movn,
        FieldId::Dmov,
        FieldId::Hls,
        FieldId::Lls,
        FieldId::Rhls,
        FieldId::Rlls,
        FieldId::Diff,
        FieldId::Rdif,
        FieldId::Egu,
        FieldId::Mres,
        FieldId::Homed,
        FieldId::Trng,
        FieldId::Phase,
        FieldId::Alarm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldId::Rrbv => "RRBV",
            FieldId::Drbv => "DRBV",
            FieldId::Rbv => "RBV",
            FieldId::Val => "VAL",
            FieldId::Dval => "DVAL",
            FieldId::Rval => "RVAL",
            FieldId::Rlv => "RLV",
            FieldId::Off => "OFF",
            FieldId::Set => "SET",
            FieldId::Foff => "FOFF",
            FieldId::Dhlm => "DHLM",
            FieldId::Dllm => "DLLM",
            FieldId::Hlm => "HLM",
            FieldId::Llm => "LLM",
            FieldId::Velo => "VELO",
            FieldId::Accl => "ACCL",
            FieldId::Bdst => "BDST",
            FieldId::Dir => "DIR",
            FieldId::Homf => "HOMF",
            FieldId::Homr => "HOMR",
            FieldId::Stop => "STOP",
            FieldId::Spmg => "SPMG",
            FieldId::Movn => "MOVN",
            FieldId::Dmov => "DMOV",
            FieldId::Hls => "HLS",
            FieldId::Lls => "LLS",
            FieldId::Rhls => "RHLS",
            FieldId::Rlls => "RLLS",
            FieldId::Diff => "DIFF",
            FieldId::Rdif => "RDIF",
            FieldId::Egu => "EGU",
            FieldId::Mres => "MRES",
            FieldId::Homed => "HOMED",
            FieldId::Trng => "TRNG",
            FieldId::Phase => "PHASE",
            FieldId::Alarm => "ALARM",
        }
    }

    pub fn descriptor(self) -> FieldDescriptor {
        use FieldType::*;
        let (access, field_type, unit_aware) = match self {
            FieldId::Rrbv | FieldId::Rdif => (Access::ReadOnly, Integer, false),
            FieldId::Drbv | FieldId::Rbv | FieldId::Diff | FieldId::Mres | FieldId::Trng => {
                (Access::ReadOnly, Float, true)
            }
            FieldId::Movn
            | FieldId::Dmov
            | FieldId::Hls
            | FieldId::Lls
            | FieldId::Rhls
            | FieldId::Rlls
            | FieldId::Homed => (Access::ReadOnly, Integer, false),
            FieldId::Egu | FieldId::Phase | FieldId::Alarm => (Access::ReadOnly, Text, false),
            FieldId::Val
            | FieldId::Dval
            | FieldId::Rlv
            | FieldId::Off
            | FieldId::Dhlm
            | FieldId::Dllm
            | FieldId::Hlm
            | FieldId::Llm
            | FieldId::Velo
            | FieldId::Bdst => (Access::Settable, Float, true),
            FieldId::Accl => (Access::Settable, Float, false),
            FieldId::Rval | FieldId::Homf | FieldId::Homr | FieldId::Stop => {
                (Access::Settable, Integer, false)
            }
            FieldId::Set | FieldId::Foff | FieldId::Dir | FieldId::Spmg => {
                (Access::Settable, Enum, false)
            }
        };
        FieldDescriptor {
            id: self,
            access,
            field_type,
            unit_aware,
        }
    }

    pub fn is_settable(self) -> bool {
        self.descriptor().access == Access::Settable
    }

    pub fn descriptors() -> Vec<FieldDescriptor> {
        Self::ALL.iter().map(|id| id.descriptor()).collect()
    }

    /// Current value of this field for `state`.
    pub fn read(self, state: &AxisStateInfo) -> FieldValue {
        let flag = |b: bool| FieldValue::Int(i64::from(b));
        match self {
            FieldId::Rrbv => FieldValue::Int(state.raw_position),
            FieldId::Drbv => FieldValue::Float(state.dial_position.value),
            FieldId::Rbv => FieldValue::Float(state.user_position.value),
            FieldId::Val => FieldValue::Float(
                state
                    .user_target
                    .unwrap_or(state.user_position)
                    .value,
            ),
            FieldId::Dval => FieldValue::Float(
                state
                    .dial_target()
                    .unwrap_or(state.dial_position)
                    .value,
            ),
            FieldId::Rval => FieldValue::Int(state.final_raw_target.unwrap_or(state.raw_position)),
            FieldId::Rlv => FieldValue::Float(0.0),
            FieldId::Off => FieldValue::Float(state.user_offset.value),
            FieldId::Set => flag(state.calibrating),
            FieldId::Foff => flag(state.calibration_mode == CalibrationMode::FixOffset),
            FieldId::Dhlm => FieldValue::Float(state.positive_dial_limit().value),
            FieldId::Dllm => FieldValue::Float(state.negative_dial_limit().value),
            FieldId::Hlm => FieldValue::Float(state.positive_user_limit.value),
            FieldId::Llm => FieldValue::Float(state.negative_user_limit.value),
            FieldId::Velo => FieldValue::Float(state.velocity.value),
            FieldId::Accl => FieldValue::Float(state.acceleration_duration.as_secs_f64()),
            FieldId::Bdst => FieldValue::Float(state.backlash_distance.value),
            FieldId::Dir => flag(state.invert_direction),
            FieldId::Homf | FieldId::Homr => FieldValue::Int(0),
            FieldId::Stop => flag(state.stop_flag),
            FieldId::Spmg => FieldValue::Int(state.spmg as i64),
            FieldId::Movn => flag(state.moving),
            FieldId::Dmov => flag(state.done_moving),
            FieldId::Hls => flag(state.limit_switches.has_upper()),
            FieldId::Lls => flag(state.limit_switches.has_lower()),
            FieldId::Rhls => flag(state.raw_limit_switches.has_upper()),
            FieldId::Rlls => flag(state.raw_limit_switches.has_lower()),
            FieldId::Diff => FieldValue::Float(state.user_difference()),
            FieldId::Rdif => FieldValue::Int(state.raw_difference()),
            FieldId::Egu => FieldValue::Text(state.unit.symbol().to_string()),
            FieldId::Mres => FieldValue::Float(state.step_size),
            FieldId::Homed => flag(state.homed),
            FieldId::Trng => FieldValue::Float(state.travel_range.map_or(0.0, |r| r.value)),
            FieldId::Phase => FieldValue::Text(state.phase.as_str().to_string()),
            FieldId::Alarm => FieldValue::Text(state.last_error.clone().unwrap_or_default()),
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        FieldId::ALL
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| BridgeError::InvalidValue {
                field: wanted.to_string(),
                reason: "unknown field".to_string(),
            })
    }
}

impl TryFrom<String> for FieldId {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldId> for String {
    fn from(id: FieldId) -> Self {
        id.name().to_string()
    }
}

/// A value written to or published on a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    fn invalid(field: FieldId, reason: impl Into<String>) -> BridgeError {
        BridgeError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Numbers are taken in `default_unit`; text may name any unit.
    pub fn as_quantity(&self, field: FieldId, default_unit: Unit) -> Result<Quantity, BridgeError> {
        match self {
            FieldValue::Int(v) => Ok(Quantity::new(*v as f64, default_unit)),
            FieldValue::Float(v) if v.is_finite() => Ok(Quantity::new(*v, default_unit)),
            FieldValue::Float(_) => Err(Self::invalid(field, "not a finite number")),
            FieldValue::Text(s) => Ok(Quantity::parse_with_default(s, default_unit)?),
            FieldValue::Bool(_) => Err(Self::invalid(field, "expected a number")),
        }
    }

    pub fn as_integer(&self, field: FieldId) -> Result<i64, BridgeError> {
        match self {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Bool(b) => Ok(i64::from(*b)),
            FieldValue::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(*v as i64),
            FieldValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Self::invalid(field, format!("'{s}' is not an integer"))),
            FieldValue::Float(v) => Err(Self::invalid(field, format!("{v} is not an integer"))),
        }
    }

    /// 0/1 style switches. Text accepts the motor-record choice names too.
    pub fn as_flag(&self, field: FieldId) -> Result<bool, BridgeError> {
        if let FieldValue::Text(s) = self {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "set" | "frozen" | "neg" => return Ok(true),
                "false" | "off" | "use" | "variable" | "pos" => return Ok(false),
                _ => {}
            }
        }
        match self.as_integer(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Self::invalid(field, format!("{other} is neither 0 nor 1"))),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_parse() {
        for id in FieldId::ALL {
            assert_eq!(id.name().parse::<FieldId>().unwrap(), id);
        }
        assert_eq!("rbv".parse::<FieldId>().unwrap(), FieldId::Rbv);
        assert!("XYZ".parse::<FieldId>().is_err());
    }

    #[test]
    fn test_read_only_fields() {
        assert!(!FieldId::Rbv.is_settable());
        assert!(!FieldId::Dmov.is_settable());
        assert!(!FieldId::Trng.is_settable());
        assert!(FieldId::Val.is_settable());
        assert!(FieldId::Spmg.is_settable());
        assert!(FieldId::Drbv.descriptor().unit_aware);
        assert!(!FieldId::Rval.descriptor().unit_aware);
    }

    #[test]
    fn test_value_from_json() {
        let v: FieldValue = serde_json::from_str("10").unwrap();
        assert_eq!(v, FieldValue::Int(10));
        let v: FieldValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(v, FieldValue::Float(2.5));
        let v: FieldValue = serde_json::from_str("\"3 um\"").unwrap();
        let q = v.as_quantity(FieldId::Val, Unit::Millimeter).unwrap();
        assert_eq!(q.unit, Unit::Micrometer);
    }

    #[test]
    fn test_flag_parsing() {
        assert!(FieldValue::Int(1).as_flag(FieldId::Stop).unwrap());
        assert!(!FieldValue::Text("Use".into()).as_flag(FieldId::Set).unwrap());
        assert!(FieldValue::Text("Frozen".into()).as_flag(FieldId::Foff).unwrap());
        assert!(FieldValue::Int(2).as_flag(FieldId::Stop).is_err());
        assert!(FieldValue::Float(1.5).as_integer(FieldId::Rval).is_err());
    }
}
