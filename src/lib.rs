//! Failover core of a stripe-based, erasure-coded key-value store.
//!
//! A coordinator moves storage servers between normal and degraded modes
//! over a group multicast bus; clients and servers follow its broadcasts,
//! and clients ack each phase once their in-flight work allows. While a
//! server is away from normal, writes are redirected and reads of its
//! chunks go through degraded locks.

#[macro_use]
mod utils;

pub mod bus;
pub mod client;
pub mod coordinator;
pub mod server;
pub mod stripe;
pub mod transit;

pub use utils::{Bitmap, StripeKvError};
pub use utils::{ME, logger_init, set_me};
