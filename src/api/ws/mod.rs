//! WebSocket transport: the single `/execute` route and the
//! `Connection` implementation backing it.

pub mod handler;

pub use handler::{ws_handler, WsConnection};
