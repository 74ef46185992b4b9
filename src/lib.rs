pub mod command;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod rclone_conf;
pub mod state;
pub mod supervisor;
