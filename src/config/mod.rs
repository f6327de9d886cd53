//! Configuration: layered task options, schedules and client settings.

pub mod options;
pub mod schedule;
pub mod settings;

pub use options::{TaskConfig, TaskOptions};
pub use settings::{ClientSettings, DEFAULT_NODE};
