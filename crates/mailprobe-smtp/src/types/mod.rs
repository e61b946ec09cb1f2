//! Core SMTP types.

mod address;
mod reply;

pub use address::{Address, Mailbox};
pub use reply::{EnhancedStatus, Reply, ReplyCode};
