//! HTTP request handlers.

pub mod bulk;
pub mod objects;
