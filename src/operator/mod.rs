pub mod builders;
pub mod cache;
pub mod catalog;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod labels;
pub mod settings;
pub mod shared;
pub mod status;
pub mod telemetry;

pub use controller::run;
