//! # rkv-testkit
//!
//! Purpose: A scripted loopback server for exercising the client engine over
//! real sockets without an external server.
//!
//! ## Design Principles
//! 1. **Real Wire**: commands are read and replies written with the same codec
//!    the client uses, on a real TCP socket.
//! 2. **Scripted First**: a test handler sees every command first; anything it
//!    declines falls through to built-in defaults (handshake, tracking, a
//!    small key/value store).
//! 3. **Observable**: every received command is logged per session so tests
//!    can assert what reached the wire, and in which order.

mod server;

pub use server::{
    eventually, Handler, LoggedCommand, MockServer, Response, ServerOptions, Session,
};
