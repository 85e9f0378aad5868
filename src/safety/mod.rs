//! Safety and cleanup
//!
//! Symlink-safe removal of sandbox and result trees, and confined file
//! access inside workspaces.

pub mod confined;
pub mod safe_cleanup;
