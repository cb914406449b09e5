//! HTTP surface of the gateway.
//!
//! Thin handlers translating requests into [`crate::app::Engine`] calls and
//! engine results into status codes.

pub mod api;
pub mod caller;
pub mod server;

pub(crate) use server::*;
