#![deny(unsafe_code)]

/// Terminal front end: command parsing and the read loop.
pub mod app;
/// Conversation domain: sessions, the generation engine and exports.
pub mod chat;
/// Settings persistence.
pub mod settings;
