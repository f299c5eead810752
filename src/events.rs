//! Driver events and their observers

use crate::state::DriverMotionState;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the cross-thread event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Discrete conditions raised during a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    /// A read or write on the socket failed; the link was dropped
    SocketError { message: String },
    /// No bytes arrived within the receive timeout
    ReceiveTimeout,
    /// Bytes were discarded to resynchronize the stream
    InvalidPacket { observed: usize, expected: usize },
    /// The controller got ahead of the loop; stale packets were skipped
    Backlog { skipped: usize },
    /// A motion request arrived while the arm could not take it
    RobotNotReady {
        request: String,
        state: DriverMotionState,
    },
}

/// Receives events synchronously, on the driver's thread
pub trait EventObserver: Send {
    fn on_event(&mut self, event: &DriverEvent);
}

impl<F> EventObserver for F
where
    F: FnMut(&DriverEvent) + Send,
{
    fn on_event(&mut self, event: &DriverEvent) {
        self(event)
    }
}

/// Forwards events into a broadcast channel for other threads
#[derive(Debug, Clone)]
pub struct BroadcastObserver(pub broadcast::Sender<DriverEvent>);

impl EventObserver for BroadcastObserver {
    fn on_event(&mut self, event: &DriverEvent) {
        // No receivers is not an error
        let _ = self.0.send(event.clone());
    }
}

/// Fan-out to registered observers, then to the driver's broadcast channel
pub struct EventNotifier {
    observers: Vec<Box<dyn EventObserver>>,
    channel: broadcast::Sender<DriverEvent>,
}

impl EventNotifier {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            observers: Vec::new(),
            channel,
        }
    }

    pub fn subscribe<O: EventObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// Sender side of the broadcast channel, for handles to subscribe through
    pub fn channel(&self) -> broadcast::Sender<DriverEvent> {
        self.channel.clone()
    }

    pub fn emit(&mut self, event: DriverEvent) {
        debug!("Event: {:?}", event);
        for observer in self.observers.iter_mut() {
            observer.on_event(&event);
        }
        let _ = self.channel.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("observers", &self.observers.len())
            .field("receivers", &self.channel.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_observers_see_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = EventNotifier::new();
        let sink = seen.clone();
        notifier.subscribe(move |event: &DriverEvent| sink.lock().unwrap().push(event.clone()));

        notifier.emit(DriverEvent::ReceiveTimeout);
        notifier.emit(DriverEvent::InvalidPacket {
            observed: 800,
            expected: 764,
        });
        notifier.emit(DriverEvent::ReceiveTimeout);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], DriverEvent::ReceiveTimeout);
        assert!(matches!(seen[1], DriverEvent::InvalidPacket { observed: 800, .. }));
    }

    #[test]
    fn test_broadcast_reaches_other_threads() {
        let mut notifier = EventNotifier::new();
        let mut receiver = notifier.channel().subscribe();

        notifier.emit(DriverEvent::RobotNotReady {
            request: "move_joint_position".to_string(),
            state: DriverMotionState::NotConnected,
        });

        let event = std::thread::spawn(move || receiver.try_recv())
            .join()
            .unwrap()
            .unwrap();
        assert!(matches!(event, DriverEvent::RobotNotReady { .. }));
    }

    #[test]
    fn test_extra_broadcast_observer() {
        let (sender, mut receiver) = broadcast::channel(4);
        let mut notifier = EventNotifier::new();
        notifier.subscribe(BroadcastObserver(sender));

        notifier.emit(DriverEvent::SocketError {
            message: "reset by peer".to_string(),
        });
        assert!(matches!(receiver.try_recv(), Ok(DriverEvent::SocketError { .. })));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DriverEvent::InvalidPacket {
            observed: 812,
            expected: 764,
        })
        .unwrap();
        assert_eq!(json["event"], "invalid_packet");
        assert_eq!(json["observed"], 812);
    }
}
