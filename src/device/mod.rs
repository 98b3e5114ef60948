pub mod bridge;
pub mod btle;
pub mod central;
pub mod connection;
pub mod constants;
pub mod events;
pub mod inventory;
pub mod scanner;
pub mod session;
pub mod types;

#[cfg(test)]
mod fake;
