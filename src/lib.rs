pub mod app;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod model;
pub mod player;
pub mod queue;
pub mod scrobble;
pub mod sync;
