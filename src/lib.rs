pub mod api;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod forecast;
pub mod occupancy;
pub mod sensor;
pub mod state;
