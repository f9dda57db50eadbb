//! Library half of the `rein` binary, so command implementations can be
//! exercised from tests.

pub mod commands;
