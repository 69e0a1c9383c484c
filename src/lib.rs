pub mod commander;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod flight;
pub mod geo;
pub mod link;
pub mod manual;
pub mod mission;
pub mod telemetry;
pub mod vehicle;
pub mod web_server;
