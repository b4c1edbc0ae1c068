//! Outer-side handle to a manager subprocess.

pub mod client;

pub use client::{manager_spec, ProcessManagerClient, DEFAULT_REQUEST_TIMEOUT};
