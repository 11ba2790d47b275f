pub mod aggregate;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod drivers;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod http;
pub mod stepper;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use error::{ConnectorError, ErrorKind};
