//! Persistence layer (component K): the abstract [`PersistencePort`] plus
//! its `sqlx`-backed Postgres implementation.

pub mod engine_store;
pub mod port;

pub use engine_store::PostgresEngineStore;
pub use port::{OpenPositionFilter, PersistencePort, PositionExit};
