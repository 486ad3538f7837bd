//! Shared helpers for the crate's unit tests.
//!
//! Compiled only under `cfg(test)`; nothing here ships in the library.

pub mod socket_guard;
