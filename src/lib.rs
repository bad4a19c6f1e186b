//! `cashbridge`: mediates between a coin hopper and banknote validator
//! attached over SSP serial and a Redis pub/sub bus (see DESIGN.md).

pub mod app;
pub mod bus;
pub mod commands;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod poll;
pub mod serial;
pub mod session;
pub mod wire;
