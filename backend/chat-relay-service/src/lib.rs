pub mod archive;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod db;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod inbox;
pub mod logging;
pub mod notify;
pub mod presence;
pub mod redis_client;
pub mod server;
pub mod session;
pub mod stanza;
pub mod state;
pub mod store;
pub mod writes;
