//! crossposter domain crate
//!
//! Core reconciliation logic, laid out hexagonally:
//! - `model`: posts, ledger records and per-service status
//! - `feed`: raw source entries handed over by input adapters
//! - `ledger`: the in-memory cross-service ledger
//! - `policy`: language, privacy and visibility rules
//! - `ports`: traits implemented by adapters
//! - `usecases`: normalize, dispatch, render, send and the run loop

pub mod feed;
pub mod ledger;
pub mod model;
pub mod policy;
pub mod ports;
pub mod usecases;

pub use feed::*;
pub use ledger::Ledger;
pub use model::*;
pub use ports::*;
