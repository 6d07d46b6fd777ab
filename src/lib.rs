pub mod activity;
pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod notification;
pub mod push_to_talk;
pub mod room;
pub mod server;
pub mod session;
pub mod share;
pub mod signaling;
pub mod webrtc;
