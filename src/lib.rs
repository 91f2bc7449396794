pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod signing;
pub mod validation;

pub use config::AppConfig;
pub use error::{EngineError, Result};
pub use persistence::{OpenPositionFilter, PersistencePort, PositionExit, PostgresEngineStore};
pub use signing::Wallet;
