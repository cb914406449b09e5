//! HMAC signing utilities for creating and validating signed messages.
//!
//! Signed messages have the form `timestamp|command|signature`, where the
//! signature is the hex encoded HMAC-SHA256 of `timestamp|command`.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac as _};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;

/// How far a signed message's timestamp may drift from the local clock, in seconds.
pub const ALLOWED_WINDOW: u64 = 30;

/// Outcome of validating a signed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmacValidationResult {
    /// Signature and timestamp are valid; carries the signed command.
    Valid(String),
    /// The message does not have the `timestamp|command|signature` shape.
    MalformedMessage,
    /// The timestamp is outside of [`ALLOWED_WINDOW`].
    InvalidTimestamp,
    /// The signature does not match.
    InvalidHmac,
}

/// Creates an HMAC instance for the given message and secret.
#[expect(
    clippy::missing_panics_doc,
    reason = "Expectation should never be false"
)]
#[must_use]
pub fn create_hmac(message: &str, secret: &[u8]) -> Hmac<Sha256> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take a key of any size");
    mac.update(message.as_bytes());
    mac
}

/// Signs a message with HMAC using the provided secret.
#[must_use]
pub fn sign_hmac(message: &str, secret: &SecretString) -> String {
    let mac = create_hmac(message, secret.expose_secret().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Creates a signed message by prepending a timestamp and appending an HMAC signature.
///
/// Returns a string of the form `timestamp|command|signature`.
#[must_use]
pub fn create_signed_message(command: &str, secret: &SecretString) -> String {
    create_signed_message_at(command, secret, unix_time_seconds())
}

fn create_signed_message_at(command: &str, secret: &SecretString, timestamp: u64) -> String {
    let message = format!("{timestamp}|{command}");
    format!("{}|{}", message, sign_hmac(&message, secret))
}

/// Splits a signed message into `(timestamp, command, signature)`.
#[must_use]
pub fn parse_hmac_message(data: &str) -> Option<(u64, String, String)> {
    let mut parts = data.trim().splitn(3, '|');
    let timestamp = parts.next()?.parse().ok()?;
    let command = parts.next()?;
    let signature = parts.next()?;
    if signature.contains('|') {
        return None;
    }
    Some((timestamp, command.to_string(), signature.to_string()))
}

/// Validates a signed message against the shared secret and the local clock.
#[must_use]
pub fn validate_hmac_message(data: &str, secret: &SecretString) -> HmacValidationResult {
    let Some((timestamp, command, signature)) = parse_hmac_message(data) else {
        return HmacValidationResult::MalformedMessage;
    };

    if unix_time_seconds().abs_diff(timestamp) > ALLOWED_WINDOW {
        return HmacValidationResult::InvalidTimestamp;
    }

    let Ok(received) = hex::decode(&signature) else {
        return HmacValidationResult::InvalidHmac;
    };

    let mac = create_hmac(&format!("{timestamp}|{command}"), secret.expose_secret().as_bytes());
    if mac.verify_slice(&received).is_ok() {
        HmacValidationResult::Valid(command)
    } else {
        HmacValidationResult::InvalidHmac
    }
}

/// Gets the current Unix timestamp in seconds.
#[expect(
    clippy::missing_panics_doc,
    reason = "Expectation should never be false"
)]
#[must_use]
pub fn unix_time_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}
