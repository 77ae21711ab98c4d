//! webshell: browser-accessible shells and file management over a single
//! WebSocket connection.
//!
//! A client opens one connection per session and multiplexes several logical
//! services over it (interactive terminals, a filesystem manipulator, a
//! chunked uploader, a heartbeat), each addressed by the `service` field of
//! a JSON envelope. Remote sessions bind the same services to an SSH host
//! and add a pull-style downloader on the HTTP side.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod fs;
pub mod heartbeat;
pub mod protocol;
pub mod pty;
pub mod service;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod transport;
pub mod upload;
