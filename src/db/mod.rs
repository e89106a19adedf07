//! Postgres access layer: one module per table, free query functions
//! plus thin wrappers implementing the store traits the engine and the
//! sweeper are written against.

pub mod customers;
pub mod shops;
pub mod visits;

use thiserror::Error;

/// Store-layer error. `Other` exists so non-Postgres implementations
/// (in-memory test stores) can report failures through the same type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}
