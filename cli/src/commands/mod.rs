pub mod adapters;
pub mod config;
pub mod generate;
pub mod serve;
pub mod status;
