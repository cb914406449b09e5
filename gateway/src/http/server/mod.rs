//! HTTP server plumbing: router assembly and middleware.

pub mod middleware;
pub mod router;
