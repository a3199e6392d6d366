//! Edge controller for GoodWe inverter/battery sites.
//!
//! Supervises one or more battery units over Modbus/TCP: imports grid
//! power toward a target SOC during the cheap tariff window, runs the
//! inverter in Auto with an export cap otherwise, watches health
//! registers for fault conditions, and ships telemetry and alerts to the
//! backend.

pub mod alerts;
pub mod battery;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod controller;
pub mod ems;
pub mod fieldbus;
pub mod health;
pub mod poster;
pub mod registers;
pub mod state;
pub mod telemetry;
