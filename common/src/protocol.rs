//! Messages the gateway sends to managed hosts.
//!
//! The idle signal is a single UDP datagram. Hosts configured with a shared
//! secret receive a signed [`HostMessage::Shutdown`]; hosts without one get the
//! legacy plain payload [`LEGACY_SHUTDOWN_PAYLOAD`].

use core::str::FromStr;

use secrecy::SecretString;
use thiserror::Error as ThisError;

use crate::signing::{HmacValidationResult, create_signed_message, validate_hmac_message};

/// Unsigned payload understood by legacy shutdown listeners.
pub const LEGACY_SHUTDOWN_PAYLOAD: &str = "true";

// Macro to define the enum from variant => string mappings
macro_rules! define_enum_with_str {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $str:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl $name {
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match *self {
                    $($name::$variant => $str,)*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($str => Ok($name::$variant),)*
                    _ => Err(()),
                }
            }
        }
    };
}

define_enum_with_str! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Commands delivered to a managed host.
    pub enum HostMessage {
        /// The domain went idle; the host should power down.
        Shutdown => "shutdown",
    }
}

/// Why a received idle datagram was rejected.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum IdleSignalError {
    #[error("signature validation failed: {0:?}")]
    Validation(HmacValidationResult),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

/// Encodes the idle datagram payload for a host.
#[must_use]
pub fn encode_idle_signal(secret: Option<&SecretString>) -> String {
    match secret {
        Some(secret) => create_signed_message(HostMessage::Shutdown.as_str(), secret),
        None => LEGACY_SHUTDOWN_PAYLOAD.to_string(),
    }
}

/// Decodes an idle datagram as a host-side listener would.
pub fn decode_idle_signal(
    raw: &str,
    secret: Option<&SecretString>,
) -> Result<HostMessage, IdleSignalError> {
    let command = match secret {
        Some(secret) => match validate_hmac_message(raw, secret) {
            HmacValidationResult::Valid(command) => command,
            other => return Err(IdleSignalError::Validation(other)),
        },
        None if raw.trim() == LEGACY_SHUTDOWN_PAYLOAD => return Ok(HostMessage::Shutdown),
        None => raw.trim().to_string(),
    };
    command
        .parse()
        .map_err(|()| IdleSignalError::UnknownCommand(command))
}
