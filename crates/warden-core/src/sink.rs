use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use warden_process::Event;

/// Receiver of every operator-visible event produced by the core.
///
/// Implementations are invoked from relay tasks, blocking PTY readers and timers alike,
/// so `emit` must never block for long and must not assume a particular thread.
pub trait Sink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn Sink>;

impl<F> Sink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

/// Dispatch port towards the owner context (UI loop, terminal renderer).
///
/// Events are queued on an unbounded channel and drained wherever the receiver lives.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn emit(&self, event: Event) {
        // The owner loop going away means nobody is left to render; drop silently.
        let _ = self.tx.send(event);
    }
}

/// Hands every event to each inner sink, in order.
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl Sink for FanoutSink {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Collects events in memory. Handy for tests and for headless inspection.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.events().iter().map(Event::render).collect()
    }
}

impl Sink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_process::LineSource;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(Event::notice(LineSource::Warden, "one"));
        sink.emit(Event::notice(LineSource::Warden, "two"));
        assert_eq!(rx.recv().await.unwrap().render(), "[warden] one");
        assert_eq!(rx.recv().await.unwrap().render(), "[warden] two");
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = MemorySink::default();
        let b = MemorySink::default();
        let fanout = FanoutSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        fanout.emit(Event::notice(LineSource::Warden, "hi"));
        assert_eq!(a.rendered(), vec!["[warden] hi"]);
        assert_eq!(b.rendered(), vec!["[warden] hi"]);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let sink: SharedSink = Arc::new(move |_ev: Event| {
            *counter.lock().unwrap() += 1;
        });
        sink.emit(Event::notice(LineSource::Warden, "x"));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
