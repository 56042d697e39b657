pub mod clock;
pub mod config;
pub mod engine;
pub mod model;
pub mod observability;
pub mod outbound;
pub mod ports;
pub mod reminder;
pub mod store;
pub mod wal;

#[cfg(test)]
mod testing;
