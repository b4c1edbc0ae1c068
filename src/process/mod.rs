//! Child-process plumbing: spawning, exit observation, stderr capture.

pub mod child;
pub mod errors;
pub mod stderr;

pub use child::{spawn_child, ChildIo, ChildSpec, ExitReport, ExitWatch, StderrMode};
pub use errors::ProcessError;
pub use stderr::{format_stderr_suffix, StderrRing};
