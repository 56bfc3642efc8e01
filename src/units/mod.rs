//! Unit-tagged quantities and the step scale that ties engineering units to
//! raw motor steps.
//!
//! Every axis-facing value (offsets, limits, backlash, velocity, intervals) is
//! carried as a [`Quantity`]. Values written in different but compatible units
//! (`um` against an `mm` axis) convert on the way in; values of a different
//! dimension (a length on a rotary axis) are rejected with
//! [`UnitError::IncompatibleUnit`].

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error("incompatible units: {from} cannot be expressed in {to}")]
    IncompatibleUnit { from: Unit, to: Unit },
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("cannot parse quantity from '{0}'")]
    Malformed(String),
    #[error("step scale must be positive and finite, got {0}")]
    InvalidScale(f64),
    #[error("{0} steps do not fit the device position range")]
    StepOverflow(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Steps,
    Length,
    Angle,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    Steps,
    Nanometer,
    Micrometer,
    Millimeter,
    Centimeter,
    Meter,
    Inch,
    Radian,
    Milliradian,
    Degree,
    Revolution,
    Second,
    Millisecond,
}

impl Unit {
    pub fn dimension(self) -> Dimension {
        match self {
            Unit::Steps => Dimension::Steps,
            Unit::Nanometer
            | Unit::Micrometer
            | Unit::Millimeter
            | Unit::Centimeter
            | Unit::Meter
            | Unit::Inch => Dimension::Length,
            Unit::Radian | Unit::Milliradian | Unit::Degree | Unit::Revolution => Dimension::Angle,
            Unit::Second | Unit::Millisecond => Dimension::Time,
        }
    }

    /// Size of one of this unit in the SI base of its dimension (m, rad, s).
    fn base_factor(self) -> f64 {
        match self {
            Unit::Steps => 1.0,
            Unit::Nanometer => 1e-9,
            Unit::Micrometer => 1e-6,
            Unit::Millimeter => 1e-3,
            Unit::Centimeter => 1e-2,
            Unit::Meter => 1.0,
            Unit::Inch => 0.0254,
            Unit::Radian => 1.0,
            Unit::Milliradian => 1e-3,
            Unit::Degree => std::f64::consts::PI / 180.0,
            Unit::Revolution => 2.0 * std::f64::consts::PI,
            Unit::Second => 1.0,
            Unit::Millisecond => 1e-3,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Steps => "steps",
            Unit::Nanometer => "nm",
            Unit::Micrometer => "um",
            Unit::Millimeter => "mm",
            Unit::Centimeter => "cm",
            Unit::Meter => "m",
            Unit::Inch => "in",
            Unit::Radian => "rad",
            Unit::Milliradian => "mrad",
            Unit::Degree => "deg",
            Unit::Revolution => "rev",
            Unit::Second => "s",
            Unit::Millisecond => "ms",
        }
    }

    pub fn is_compatible_with(self, other: Unit) -> bool {
        self.dimension() == other.dimension()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim() {
            "step" | "steps" => Unit::Steps,
            "nm" => Unit::Nanometer,
            "um" | "µm" | "micron" => Unit::Micrometer,
            "mm" | "millimeter" => Unit::Millimeter,
            "cm" => Unit::Centimeter,
            "m" | "meter" => Unit::Meter,
            "in" | "inch" => Unit::Inch,
            "rad" | "radian" => Unit::Radian,
            "mrad" => Unit::Milliradian,
            "deg" | "degree" | "degrees" => Unit::Degree,
            "rev" | "turn" => Unit::Revolution,
            "s" | "sec" => Unit::Second,
            "ms" => Unit::Millisecond,
            other => return Err(UnitError::UnknownUnit(other.to_string())),
        };
        Ok(unit)
    }
}

impl TryFrom<String> for Unit {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.symbol().to_string()
    }
}

/// A value tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub const fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn zero(unit: Unit) -> Self {
        Self::new(0.0, unit)
    }

    pub fn convert(self, target: Unit) -> Result<Quantity, UnitError> {
        convert(self, target)
    }

    /// Magnitude expressed in `unit`.
    pub fn value_in(self, unit: Unit) -> Result<f64, UnitError> {
        Ok(convert(self, unit)?.value)
    }

    pub fn checked_add(self, rhs: Quantity) -> Result<Quantity, UnitError> {
        let rhs = rhs.convert(self.unit)?;
        Ok(Quantity::new(self.value + rhs.value, self.unit))
    }

    pub fn checked_sub(self, rhs: Quantity) -> Result<Quantity, UnitError> {
        let rhs = rhs.convert(self.unit)?;
        Ok(Quantity::new(self.value - rhs.value, self.unit))
    }

    pub fn scale(self, factor: f64) -> Quantity {
        Quantity::new(self.value * factor, self.unit)
    }

    pub fn abs(self) -> Quantity {
        Quantity::new(self.value.abs(), self.unit)
    }

    pub fn to_duration(self) -> Result<Duration, UnitError> {
        let seconds = self.value_in(Unit::Second)?;
        if seconds < 0.0 {
            return Err(UnitError::Malformed(self.to_string()));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    /// Parse `"<number> [unit]"`, taking `default_unit` when no unit is written.
    pub fn parse_with_default(s: &str, default_unit: Unit) -> Result<Quantity, UnitError> {
        let (value, unit) = parse_parts(s)?;
        Ok(Quantity::new(value, unit.unwrap_or(default_unit)))
    }

    /// Parse a rate such as `"5 mm/s"`; the returned quantity carries the
    /// distance unit and is understood per second.
    pub fn parse_rate(s: &str) -> Result<Quantity, UnitError> {
        let (distance, per) = s
            .split_once('/')
            .ok_or_else(|| UnitError::Malformed(s.to_string()))?;
        let per: Unit = per.parse()?;
        if per.dimension() != Dimension::Time {
            return Err(UnitError::IncompatibleUnit {
                from: per,
                to: Unit::Second,
            });
        }
        let distance: Quantity = distance.parse()?;
        let seconds = Quantity::new(1.0, per).value_in(Unit::Second)?;
        Ok(distance.scale(1.0 / seconds))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

impl FromStr for Quantity {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_parts(s)? {
            (value, Some(unit)) => Ok(Quantity::new(value, unit)),
            (_, None) => Err(UnitError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for Quantity {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

/// A distance or angle per second, written `"5 mm/s"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate(pub Quantity);

impl Rate {
    pub fn per_second(self) -> Quantity {
        self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/s", self.0.value, self.0.unit)
    }
}

impl FromStr for Rate {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse_rate(s).map(Rate)
    }
}

impl TryFrom<String> for Rate {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(r: Rate) -> Self {
        r.to_string()
    }
}

/// Steps per engineering unit, e.g. `25600 steps/mm`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepScale {
    pub steps_per_unit: f64,
    pub unit: Unit,
}

impl StepScale {
    pub fn new(steps_per_unit: f64, unit: Unit) -> Result<Self, UnitError> {
        if !steps_per_unit.is_finite() || steps_per_unit <= 0.0 {
            return Err(UnitError::InvalidScale(steps_per_unit));
        }
        if unit.dimension() == Dimension::Steps || unit.dimension() == Dimension::Time {
            return Err(UnitError::IncompatibleUnit {
                from: unit,
                to: Unit::Millimeter,
            });
        }
        Ok(Self {
            steps_per_unit,
            unit,
        })
    }

    /// The same scale expressed per `unit`, e.g. `25600 steps/mm` as
    /// `25.6 steps/um`.
    pub fn in_unit(self, unit: Unit) -> Result<StepScale, UnitError> {
        let one = Quantity::new(1.0, unit).value_in(self.unit)?;
        StepScale::new(self.steps_per_unit * one, unit)
    }

    /// Size of a single step, in `unit`.
    pub fn resolution(&self, unit: Unit) -> Result<f64, UnitError> {
        from_raw_steps(1, self).value_in(unit)
    }
}

impl fmt::Display for StepScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} steps/{}", self.steps_per_unit, self.unit)
    }
}

impl FromStr for StepScale {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (steps, per) = s
            .split_once('/')
            .ok_or_else(|| UnitError::Malformed(s.to_string()))?;
        let steps: Quantity = steps.parse()?;
        if steps.unit != Unit::Steps {
            return Err(UnitError::IncompatibleUnit {
                from: steps.unit,
                to: Unit::Steps,
            });
        }
        StepScale::new(steps.value, per.parse()?)
    }
}

impl TryFrom<String> for StepScale {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StepScale> for String {
    fn from(s: StepScale) -> Self {
        s.to_string()
    }
}

fn parse_parts(s: &str) -> Result<(f64, Option<Unit>), UnitError> {
    let trimmed = s.trim();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        let c = bytes[end];
        let exponent = (c == b'e' || c == b'E')
            && end > 0
            && bytes
                .get(end + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == b'-' || *n == b'+');
        if c.is_ascii_digit() || c == b'.' || c == b'-' || c == b'+' || exponent {
            end += 1;
        } else {
            break;
        }
    }
    let (number, unit) = trimmed.split_at(end);
    let value: f64 = number
        .parse()
        .map_err(|_| UnitError::Malformed(s.to_string()))?;
    if !value.is_finite() {
        return Err(UnitError::Malformed(s.to_string()));
    }
    let unit = unit.trim();
    if unit.is_empty() {
        Ok((value, None))
    } else {
        Ok((value, Some(unit.parse()?)))
    }
}

pub fn convert(quantity: Quantity, target: Unit) -> Result<Quantity, UnitError> {
    if quantity.unit == target {
        return Ok(quantity);
    }
    if !quantity.unit.is_compatible_with(target) {
        return Err(UnitError::IncompatibleUnit {
            from: quantity.unit,
            to: target,
        });
    }
    let value = quantity.value * quantity.unit.base_factor() / target.base_factor();
    Ok(Quantity::new(value, target))
}

/// Nearest whole step for `quantity`. Quantities already in steps pass
/// through the rounding unchanged.
pub fn to_raw_steps(quantity: Quantity, scale: &StepScale) -> Result<i64, UnitError> {
    let steps = if quantity.unit == Unit::Steps {
        quantity.value
    } else {
        quantity.value_in(scale.unit)? * scale.steps_per_unit
    };
    let rounded = steps.round();
    if !rounded.is_finite() || rounded.abs() > i64::MAX as f64 {
        return Err(UnitError::StepOverflow(steps));
    }
    Ok(rounded as i64)
}

pub fn from_raw_steps(steps: i64, scale: &StepScale) -> Quantity {
    Quantity::new(steps as f64 / scale.steps_per_unit, scale.unit)
}
