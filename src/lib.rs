//! Serial control for AV projectors and receivers, with a UDP command daemon
//! built on a small threaded socket runtime.

pub mod client;
pub mod config;
pub mod device;
pub mod net;
pub mod protocol;
pub mod server;
