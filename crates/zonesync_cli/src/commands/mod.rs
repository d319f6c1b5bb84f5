//! CLI command implementations.

pub mod inspect;
pub mod reset;
pub mod state;
