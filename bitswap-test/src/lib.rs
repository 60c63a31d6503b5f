//! Internal utilities to support testing of the bitswap engine.

pub mod logging;
