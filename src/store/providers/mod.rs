pub mod postgres;

pub use postgres::{PostgresCheckpointStore, PostgresRunStore, connect};
