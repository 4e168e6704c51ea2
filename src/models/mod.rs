//! Models module.
pub mod toppush;
