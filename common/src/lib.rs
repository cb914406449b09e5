//! Wire formats shared between the Hall gateway and host-side tooling.
//!
//! This crate provides:
//! - MAC address parsing and Wake-On-Lan magic packet construction
//! - Timestamped HMAC message signing and validation
//! - The idle (shutdown) datagram understood by hosts managed by the gateway
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "This is not problematic in tests",)
)]
#![expect(
    clippy::missing_errors_doc,
    reason = "The situation it maps to errors should be obvious."
)]

extern crate alloc;
extern crate core;

mod magic_packet;
mod protocol;
mod signing;

pub use magic_packet::*;
pub use protocol::*;
pub use signing::*;
