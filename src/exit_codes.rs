//! Stable exit codes for the mochi CLI.

/// Run completed and every task succeeded.
pub const OK: i32 = 0;
/// Setup error (missing deps, unreadable input, no tasks, filter miss,
/// workspace creation failure) or at least one task failed.
pub const FAILURE: i32 = 1;
