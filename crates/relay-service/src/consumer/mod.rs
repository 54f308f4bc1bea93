mod recorder;

use std::sync::Arc;

use svckit_core::Error;
use svckit_mq::{Handler, Registrations};

pub use recorder::{Recorder, last_message_key};

/// Registers `handler` for every topic on `queue`.
///
/// # Errors
///
/// Returns `Error::Configuration` if no topic is given or a topic repeats.
pub fn registrations(
    queue: &str,
    topics: &[String],
    handler: Arc<dyn Handler>,
) -> Result<Registrations, Error> {
    if topics.is_empty() {
        return Err(Error::Configuration(format!(
            "no topics configured for queue '{queue}'"
        )));
    }

    let mut registrations = Registrations::new();
    for topic in topics {
        registrations.register_arc(queue, topic.as_str(), Arc::clone(&handler))?;
    }
    Ok(registrations)
}
