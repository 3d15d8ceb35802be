pub mod capture;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod state;
pub mod web;
