//! Request/response bridge exposing buffer contents to remote consumers.

pub mod client;
pub mod protocol;
pub mod server;
