//! Backing object stores.
//!
//! The [`backend::ObjectStore`] trait abstracts over where bytes
//! physically live.  Implementations include process memory, local disk,
//! and an S3-compatible bucket.

pub mod aws;
pub mod backend;
pub mod local;
pub mod memory;
