pub mod benchmark;
pub mod cli;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod timestamp;

pub use benchmark::{harness, runner};
pub use error::{RecorderError, Result};
pub use metrics::collector;
