pub mod api;
pub mod classroom;
pub mod config;
pub mod error;
