use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use super::{DeviceStatus, DriverError, HomeDirection, LimitSwitchBits, MotorController};

const ACTUAL_POSITION: u16 = 1;
const ACTUAL_SPEED: u16 = 3;
const END_SWITCH_DISTANCE: u16 = 196;

/// Mechanics of the simulated board, in raw steps.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    /// Distance covered between two status reads while moving.
    pub steps_per_poll: i64,
    /// Physical positions of the negative and positive limit switches.
    pub negative_end: i64,
    pub positive_end: i64,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self {
            steps_per_poll: 12_800,
            negative_end: -10_000_000,
            positive_end: 10_000_000,
        }
    }
}

#[derive(Debug, Default)]
struct SimAxis {
    physical: i64,
    /// Physical position reported as raw 0.
    origin: i64,
    target: Option<i64>,
    homing: bool,
    parameters: HashMap<u16, i64>,
    visited: Vec<i64>,
}

impl SimAxis {
    fn raw(&self) -> i64 {
        self.physical - self.origin
    }
}

#[derive(Debug, Default)]
struct SimState {
    axes: HashMap<u8, SimAxis>,
    globals: HashMap<(u8, u16), i64>,
    failing: bool,
}

/// In-process board: motion advances on every status read, so a test drives
/// the mechanics simply by polling.
pub struct SimulatedController {
    board: SimulatedBoard,
    state: Mutex<SimState>,
}

impl SimulatedController {
    pub fn new(board: SimulatedBoard) -> Self {
        Self {
            board,
            state: Mutex::new(SimState::default()),
        }
    }

    /// While set, every operation fails as if the link were down.
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Raw points passed to absolute moves on `axis`, oldest first.
    pub async fn visited(&self, axis: u8) -> Vec<i64> {
        self.state
            .lock()
            .await
            .axes
            .get(&axis)
            .map(|a| a.visited.clone())
            .unwrap_or_default()
    }

    pub async fn parameter(&self, axis: u8, parameter: u16) -> Option<i64> {
        self.state
            .lock()
            .await
            .axes
            .get(&axis)
            .and_then(|a| a.parameters.get(&parameter).copied())
    }

    /// Change a parameter without going through the driver interface.
    pub async fn set_parameter(&self, axis: u8, parameter: u16, value: i64) {
        self.state
            .lock()
            .await
            .axes
            .entry(axis)
            .or_default()
            .parameters
            .insert(parameter, value);
    }

    pub async fn global_parameter(&self, bank: u8, parameter: u16) -> Option<i64> {
        self.state.lock().await.globals.get(&(bank, parameter)).copied()
    }

    /// Lock the state and fetch `axis`, failing when the link is down.
    async fn with_axis<T>(&self, axis: u8, f: impl FnOnce(&mut SimAxis) -> T) -> Result<T, DriverError> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(DriverError::Disconnected);
        }
        Ok(f(state.axes.entry(axis).or_default()))
    }

    fn advance(&self, axis: &mut SimAxis) {
        let Some(target) = axis.target else {
            return;
        };
        let board = &self.board;
        let diff = target - axis.physical;
        let step = diff.signum() * diff.abs().min(board.steps_per_poll);
        let next = (axis.physical + step).clamp(board.negative_end, board.positive_end);
        let blocked = next == axis.physical && next != target;
        axis.physical = next;
        if next == target || blocked || next == board.negative_end || next == board.positive_end {
            axis.target = None;
            if axis.homing {
                axis.origin = axis.physical;
                axis.homing = false;
                debug!("simulated reference search finished at physical {}", axis.physical);
            }
        }
    }

    fn limits(&self, axis: &SimAxis) -> LimitSwitchBits {
        LimitSwitchBits {
            positive: axis.physical >= self.board.positive_end,
            negative: axis.physical <= self.board.negative_end,
        }
    }
}

#[async_trait::async_trait]
impl MotorController for SimulatedController {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn write_parameter(&self, axis: u8, parameter: u16, value: i64) -> Result<(), DriverError> {
        self.with_axis(axis, |a| {
            if parameter == ACTUAL_POSITION {
                a.origin = a.physical - value;
            } else {
                a.parameters.insert(parameter, value);
            }
        })
        .await
    }

    async fn read_parameter(&self, axis: u8, parameter: u16) -> Result<i64, DriverError> {
        self.with_axis(axis, |a| match parameter {
            ACTUAL_POSITION => a.raw(),
            ACTUAL_SPEED => i64::from(a.target.is_some()),
            END_SWITCH_DISTANCE => self.board.positive_end - self.board.negative_end,
            _ => a.parameters.get(&parameter).copied().unwrap_or(0),
        })
        .await
    }

    async fn move_absolute(&self, axis: u8, raw_position: i64) -> Result<(), DriverError> {
        self.with_axis(axis, |a| {
            a.visited.push(raw_position);
            a.target = Some(raw_position + a.origin);
            a.homing = false;
        })
        .await
    }

    async fn move_relative(&self, axis: u8, raw_delta: i64) -> Result<(), DriverError> {
        self.with_axis(axis, |a| {
            let base = a.target.unwrap_or(a.physical);
            a.visited.push(base + raw_delta - a.origin);
            a.target = Some(base + raw_delta);
            a.homing = false;
        })
        .await
    }

    async fn reference_search(&self, axis: u8, direction: HomeDirection) -> Result<(), DriverError> {
        let end = match direction {
            HomeDirection::Positive => self.board.positive_end,
            HomeDirection::Negative => self.board.negative_end,
        };
        self.with_axis(axis, |a| {
            a.target = Some(end);
            a.homing = true;
        })
        .await
    }

    async fn stop(&self, axis: u8) -> Result<(), DriverError> {
        self.with_axis(axis, |a| {
            a.target = None;
            a.homing = false;
        })
        .await
    }

    async fn get_status(&self, axis: u8) -> Result<DeviceStatus, DriverError> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(DriverError::Disconnected);
        }
        let a = state.axes.entry(axis).or_default();
        self.advance(a);
        Ok(DeviceStatus {
            raw_position: a.raw(),
            moving: a.target.is_some(),
            limit_switches: self.limits(a),
        })
    }

    async fn write_global_parameter(&self, bank: u8, parameter: u16, value: i64) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(DriverError::Disconnected);
        }
        state.globals.insert((bank, parameter), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> SimulatedController {
        SimulatedController::new(SimulatedBoard {
            steps_per_poll: 100,
            negative_end: -250,
            positive_end: 1_000,
        })
    }

    #[tokio::test]
    async fn test_motion_advances_per_status_read() {
        let sim = board();
        sim.move_absolute(0, 250).await.unwrap();
        let s = sim.get_status(0).await.unwrap();
        assert_eq!((s.raw_position, s.moving), (100, true));
        sim.get_status(0).await.unwrap();
        let s = sim.get_status(0).await.unwrap();
        assert_eq!((s.raw_position, s.moving), (250, false));
        assert_eq!(sim.visited(0).await, vec![250]);
    }

    #[tokio::test]
    async fn test_relative_move_from_current_position() {
        let sim = board();
        sim.move_absolute(0, 150).await.unwrap();
        sim.get_status(0).await.unwrap();
        sim.get_status(0).await.unwrap();
        sim.move_relative(0, -200).await.unwrap();
        let mut status = sim.get_status(0).await.unwrap();
        while status.moving {
            status = sim.get_status(0).await.unwrap();
        }
        assert_eq!(status.raw_position, -50);
        assert_eq!(sim.visited(0).await, vec![150, -50]);
    }

    #[tokio::test]
    async fn test_reference_search_zeroes_at_switch() {
        let sim = board();
        sim.reference_search(0, HomeDirection::Negative).await.unwrap();
        let mut status = sim.get_status(0).await.unwrap();
        while status.moving {
            status = sim.get_status(0).await.unwrap();
        }
        assert_eq!(status.raw_position, 0);
        assert!(status.limit_switches.negative);
        assert!(!status.limit_switches.positive);
    }

    #[tokio::test]
    async fn test_actual_position_rewrite_shifts_frame() {
        let sim = board();
        sim.write_parameter(0, ACTUAL_POSITION, 500).await.unwrap();
        assert_eq!(sim.read_parameter(0, ACTUAL_POSITION).await.unwrap(), 500);
        sim.move_absolute(0, 600).await.unwrap();
        let s = sim.get_status(0).await.unwrap();
        assert_eq!(s.raw_position, 600);
        assert!(!s.moving);
    }

    #[tokio::test]
    async fn test_end_switch_distance_is_travel_span() {
        let sim = board();
        assert_eq!(sim.read_parameter(0, END_SWITCH_DISTANCE).await.unwrap(), 1_250);
    }

    #[tokio::test]
    async fn test_failing_link() {
        let sim = board();
        sim.set_failing(true).await;
        assert!(matches!(sim.get_status(0).await, Err(DriverError::Disconnected)));
        assert!(sim.stop(0).await.is_err());
        sim.set_failing(false).await;
        assert!(sim.get_status(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_travel_stops_at_limit() {
        let sim = board();
        sim.move_absolute(0, 5_000).await.unwrap();
        let mut status = sim.get_status(0).await.unwrap();
        while status.moving {
            status = sim.get_status(0).await.unwrap();
        }
        assert_eq!(status.raw_position, 1_000);
        assert!(status.limit_switches.positive);
    }
}
