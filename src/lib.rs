#![warn(rust_2018_idioms)]

pub mod config;
pub mod controller;
pub mod error;
pub mod gpio;
pub mod http;
pub mod monitor;
pub mod mqtt_client;
pub mod port;
pub mod store;
pub mod timing;
