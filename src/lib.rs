//! Solar power diverter.
//!
//! Reads grid power, runs a PID controller toward a setpoint and spreads the
//! resulting budget over resistive loads driven by phase-cut dimmers.

pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod telemetry;
