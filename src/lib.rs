//! wsfs: a workspace-scoped virtual filesystem for remote clients
//!
//! Every client-supplied path is resolved against a single workspace root,
//! checked by a security policy, and only then touched on disk.

pub mod filesystem;
pub mod protocol;
