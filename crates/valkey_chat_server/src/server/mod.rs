#![forbid(unsafe_code)]

pub mod backfill;
pub mod connection;
pub mod health;
pub mod relay;
pub mod state;
pub mod transport;




#[cfg(test)]
mod transport_tests;

#[cfg(test)]
mod test_support;
