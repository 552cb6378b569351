pub mod config;
pub mod generate;
pub mod models;
pub mod serve;
