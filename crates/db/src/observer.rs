//! Scheduler observer feeding the debug server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use strand_vm::{ChunkId, ExitReason, LinkReport, Observer, Pid, RuntimeError};

/// Lifecycle event forwarded from a scheduler or loader.
#[derive(Clone, Debug, PartialEq)]
pub enum DebugEvent {
    Spawned(Pid),
    Exited { pid: Pid, normal: bool },
    Thrown { pid: Pid, error: String },
    Break { pid: Pid, ip: usize },
    Linked { linked: Vec<ChunkId>, superseded: Vec<ChunkId> },
}

/// Forwards lifecycle events over a channel.
///
/// Clones share the pause flag, so the embedder can keep one clone and
/// attach another to the scheduler.
#[derive(Clone)]
pub struct DebugObserver {
    events: Sender<DebugEvent>,
    paused: Arc<AtomicBool>,
}

impl DebugObserver {
    pub fn new(events: Sender<DebugEvent>) -> Self {
        Self {
            events,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `on_step` stop the scheduler's run loop until `resume`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Hook for `Loader::on_linked`.
    pub fn link_hook(&self) -> impl Fn(&LinkReport) + Send + Sync + 'static {
        let events = self.events.clone();
        move |report| {
            send(
                &events,
                DebugEvent::Linked {
                    linked: report.linked.clone(),
                    superseded: report.superseded.clone(),
                },
            )
        }
    }

    fn emit(&self, event: DebugEvent) {
        send(&self.events, event);
    }
}

// The server may be gone; events are best effort.
fn send(events: &Sender<DebugEvent>, event: DebugEvent) {
    if events.send(event).is_err() {
        tracing::trace!("debug event dropped");
    }
}

impl Observer for DebugObserver {
    fn on_spawn(&mut self, pid: Pid) {
        self.emit(DebugEvent::Spawned(pid));
    }

    fn on_exit(&mut self, pid: Pid, reason: &ExitReason) {
        let normal = matches!(reason, ExitReason::Normal(_));
        self.emit(DebugEvent::Exited { pid, normal });
    }

    fn on_throw(&mut self, pid: Pid, error: &RuntimeError) {
        self.emit(DebugEvent::Thrown {
            pid,
            error: error.to_string(),
        });
    }

    fn on_step(&mut self) -> bool {
        !self.is_paused()
    }

    fn on_break(&mut self, pid: Pid, ip: usize) {
        self.emit(DebugEvent::Break { pid, ip });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use strand_vm::Payload;

    #[test]
    fn test_events_are_forwarded() {
        let (tx, rx) = unbounded();
        let mut obs = DebugObserver::new(tx);
        obs.on_spawn(Pid(1));
        obs.on_throw(Pid(1), &RuntimeError::BadIndex(3));
        obs.on_exit(Pid(1), &ExitReason::Normal(Payload::Nil));

        assert_eq!(rx.try_recv().unwrap(), DebugEvent::Spawned(Pid(1)));
        assert!(matches!(rx.try_recv().unwrap(), DebugEvent::Thrown { pid: Pid(1), .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            DebugEvent::Exited { pid: Pid(1), normal: true }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pause_is_shared_between_clones() {
        let (tx, _rx) = unbounded();
        let control = DebugObserver::new(tx);
        let mut attached = control.clone();
        assert!(attached.on_step());
        control.pause();
        assert!(!attached.on_step());
        control.resume();
        assert!(attached.on_step());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut obs = DebugObserver::new(tx);
        obs.on_spawn(Pid(2));
        obs.link_hook()(&LinkReport::default());
    }

    #[test]
    fn test_link_hook_forwards_report() {
        let (tx, rx) = unbounded();
        let hook = DebugObserver::new(tx).link_hook();
        hook(&LinkReport::default());
        assert_eq!(
            rx.try_recv().unwrap(),
            DebugEvent::Linked { linked: vec![], superseded: vec![] }
        );
    }
}
