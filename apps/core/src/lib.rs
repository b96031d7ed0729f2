pub mod cache;
pub mod client;
pub mod config;
pub mod contract;
pub mod endpoint;
pub mod health;
pub mod hotkey;
pub mod hotkey_runtime;
pub mod logging;
pub mod model;
pub mod port;
pub mod progress;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod window;
