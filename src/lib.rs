pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod models;
pub mod pipeline;
