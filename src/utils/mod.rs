//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod bitmap;
mod safetcp;

pub use error::StripeKvError;
pub use bitmap::Bitmap;
pub use print::{ME, logger_init, set_me};

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
