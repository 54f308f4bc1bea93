mod health;
mod messages;

pub use health::{health, ready};
pub use messages::{last_message, list_messages, publish_message};
