use std::time::Duration;

use crate::{
    error::BridgeError,
    units::{to_raw_steps, Quantity, StepScale},
};

use super::config::AxisConfig;

/// Velocity and ramp settings in force on an axis; `VELO`/`ACCL` writes
/// replace them at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementParams {
    /// Per second, in the axis unit.
    pub velocity: Quantity,
    /// Time to ramp from standstill to `velocity`.
    pub acceleration_duration: Duration,
}

impl MovementParams {
    pub fn from_config(config: &AxisConfig) -> Self {
        Self {
            velocity: config.max_velocity,
            acceleration_duration: config.acceleration_duration,
        }
    }

    pub fn with_velocity(mut self, velocity: Quantity) -> Result<Self, BridgeError> {
        if !(velocity.value > 0.0) {
            return Err(BridgeError::InvalidValue {
                field: "VELO".to_string(),
                reason: "velocity must be positive".to_string(),
            });
        }
        self.velocity = velocity;
        Ok(self)
    }

    pub fn with_acceleration_duration(mut self, duration: Duration) -> Result<Self, BridgeError> {
        if duration.is_zero() {
            return Err(BridgeError::InvalidValue {
                field: "ACCL".to_string(),
                reason: "acceleration time must be positive".to_string(),
            });
        }
        self.acceleration_duration = duration;
        Ok(self)
    }

    /// Velocity in steps per second, at least one.
    pub fn velocity_steps(&self, scale: &StepScale) -> Result<i64, BridgeError> {
        Ok(to_raw_steps(self.velocity, scale)?.max(1))
    }

    /// Acceleration in steps per second squared, at least one.
    pub fn acceleration_steps(&self, scale: &StepScale) -> Result<i64, BridgeError> {
        let per_s2 = self
            .velocity
            .scale(1.0 / self.acceleration_duration.as_secs_f64());
        Ok(to_raw_steps(per_s2, scale)?.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::config::tests::linear_config;
    use crate::units::Unit;

    #[test]
    fn test_device_units_from_config() {
        let config = linear_config();
        let params = MovementParams::from_config(&config);
        assert_eq!(params.velocity_steps(&config.steps_per_unit).unwrap(), 128_000);
        // 5 mm/s reached in 0.5 s
        assert_eq!(
            params.acceleration_steps(&config.steps_per_unit).unwrap(),
            256_000
        );
    }

    #[test]
    fn test_rejects_non_positive_values() {
        let params = MovementParams::from_config(&linear_config());
        assert!(params
            .with_velocity(Quantity::new(0.0, Unit::Millimeter))
            .is_err());
        assert!(params.with_acceleration_duration(Duration::ZERO).is_err());
        let faster = params
            .with_velocity(Quantity::new(10.0, Unit::Millimeter))
            .unwrap();
        assert_eq!(faster.velocity.value, 10.0);
    }
}
