//! Core POP3 types.

mod message;
mod response;

pub use message::{MessageInfo, Stat, parse_list_line, parse_uidl_line};
pub use response::{Response, ResponseCode, Status};
