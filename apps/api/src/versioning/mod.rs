pub mod error;
pub mod handlers;
#[cfg(test)]
pub mod memory;
pub mod patch;
pub mod postgres;
pub mod service;
pub mod store;
