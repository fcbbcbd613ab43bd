//! Sample buffering and persistence.
pub mod buffer;
pub mod persister;
pub mod sample;
