#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    clippy::suspicious,
    // missing_docs,
    clippy::nursery,
    rust_2018_idioms
)]

pub mod engine;
pub mod exporter;
pub mod logging;
pub mod management;
pub mod metrics;
pub mod model;
pub mod settings;
pub mod tracker;

pub type Result<T> = anyhow::Result<T>;
