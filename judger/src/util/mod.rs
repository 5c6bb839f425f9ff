pub mod async_teardown;
pub mod path_security;

pub use async_teardown::*;
