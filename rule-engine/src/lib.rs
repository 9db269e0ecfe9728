pub mod alerts;
pub mod config;
pub mod consumer;
pub mod db;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod rules;
pub mod state;

pub use engine::{Evaluation, RuleEngine};
pub use errors::{Error, Result};
pub use model::{Alert, RuleType};
