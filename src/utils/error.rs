//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for the copyset crate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CopysetError(String);

impl CopysetError {
    pub fn msg(msg: impl ToString) -> Self {
        CopysetError(msg.to_string())
    }
}

impl fmt::Display for CopysetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for CopysetError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `CopysetError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CopysetError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CopysetError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
