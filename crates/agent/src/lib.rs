pub mod actions;
pub mod bus;
pub mod config;
pub mod facts;
pub mod handlers;
pub mod sampler;
pub mod telemetry;
pub mod update;
