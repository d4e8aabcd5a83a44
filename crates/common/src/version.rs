/// Crate version shared by the controller and the agent binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
