//! Bridge between motor-record style fields and a TMCL stepper board.

pub mod axis;
pub mod config;
pub mod error;
pub mod fields;
pub mod motor_controller;
pub mod protocol;
pub mod socket_server;
pub mod supervisor;
pub mod units;

pub use error::BridgeError;
