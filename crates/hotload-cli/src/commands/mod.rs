//! Command implementations

pub mod inspect;
pub mod purge;
pub mod run;
