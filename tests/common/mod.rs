#[macro_use]
pub mod macros;

pub mod harness;
pub mod logger;
