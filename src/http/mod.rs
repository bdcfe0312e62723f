//! HTTP surface: live MP3 streams for cast targets plus a JSON status API

pub mod handlers;
pub mod server;

pub use server::{AppState, WebServer};
