#[macro_use]
extern crate tracing;

pub mod collector;
pub mod config;
pub mod identity;
pub mod janitor;
mod log;
pub mod secret;
pub mod sender;
pub mod service;
pub mod task;
pub mod transport;
mod version;
pub mod worker;
