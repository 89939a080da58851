mod handler;
mod message;
mod session;

pub use handler::ws_handler;
pub use message::{ClientMessage, CloseReason, ServerMessage};
pub use session::{ConnectionState, Session};
