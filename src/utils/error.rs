//! Error type shared by every stripekv role: bus plumbing, state message
//! decoding, config parsing and the transition handlers all report through
//! `StripeKvError`.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Human-readable failure description. Callers match on success or failure
/// only; the text is what ends up in the logs.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StripeKvError(pub(crate) String);

impl StripeKvError {
    pub fn msg(msg: impl ToString) -> Self {
        StripeKvError(msg.to_string())
    }
}

impl fmt::Display for StripeKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl error::Error for StripeKvError {}

// `?` on the listed error types keeps only their message.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for StripeKvError {
            fn from(e: $error) -> Self {
                StripeKvError(e.to_string())
            }
        }
    };
}

// Same for channel errors generic over the payload that failed to send.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for StripeKvError {
            fn from(e: $error) -> Self {
                StripeKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
