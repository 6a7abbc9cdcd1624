//! Bridge that fuses a pair of Joy-Con 2 halves into one virtual gamepad.

pub mod domain;
pub mod infrastructure;
