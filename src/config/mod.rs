//! Configuration constants for ExtentDB.
//!
//! All tunable values live in [`constants`]; import them from there rather
//! than defining local copies.

mod constants;

pub use constants::*;
