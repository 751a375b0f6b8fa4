use tokio::sync::broadcast;

use crate::reliability::events::ExchangeEvent;

/// all events that are currently available without waiting
pub fn drain_events(receiver: &mut broadcast::Receiver<ExchangeEvent>) -> Vec<ExchangeEvent> {
    let mut result = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        result.push(event);
    }
    result
}
