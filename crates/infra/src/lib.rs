pub mod config;
pub mod db;
pub mod logging;
pub mod relay;
pub mod repositories;
pub mod wiring;
