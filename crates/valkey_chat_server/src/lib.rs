#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod server;
pub mod util;
