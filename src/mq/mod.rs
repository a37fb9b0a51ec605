pub mod budget;
pub mod config;
pub mod cpu;
pub mod ctx;
pub mod hctx;
pub mod plug;
pub mod queue;
mod sched;
pub mod submit;
