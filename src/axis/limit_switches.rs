use crate::motor_controller::LimitSwitchBits;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitSwitches {
    #[default]
    None,
    Upper,
    Lower,
    Both,
}

impl LimitSwitches {
    pub fn from_flags(upper: bool, lower: bool) -> Self {
        match (upper, lower) {
            (false, false) => LimitSwitches::None,
            (true, false) => LimitSwitches::Upper,
            (false, true) => LimitSwitches::Lower,
            (true, true) => LimitSwitches::Both,
        }
    }

    /// Raw inputs as reported: upper is the positive-raw switch.
    pub fn from_raw(bits: LimitSwitchBits) -> Self {
        Self::from_flags(bits.positive, bits.negative)
    }

    /// Apply polarity correction, then optionally swap ends.
    pub fn process(bits: LimitSwitchBits, swap: bool, invert_values: bool) -> Self {
        let (positive, negative) = Self::active_inputs(bits, invert_values);
        if swap {
            Self::from_flags(negative, positive)
        } else {
            Self::from_flags(positive, negative)
        }
    }

    /// Polarity-corrected `(positive, negative)` inputs, in raw orientation.
    pub fn active_inputs(bits: LimitSwitchBits, invert_values: bool) -> (bool, bool) {
        (
            bits.positive != invert_values,
            bits.negative != invert_values,
        )
    }

    pub fn has_upper(&self) -> bool {
        matches!(self, LimitSwitches::Upper | LimitSwitches::Both)
    }

    pub fn has_lower(&self) -> bool {
        matches!(self, LimitSwitches::Lower | LimitSwitches::Both)
    }
}
