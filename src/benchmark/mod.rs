pub mod harness;
pub mod runner;
