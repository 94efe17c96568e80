//! Task lifecycle event log.
//!
//! Every task milestone is published as a typed [`TaskEvent`], stamped
//! with a sequence number and wall-clock time at publication. Two readers
//! exist: live subscribers on a broadcast channel (a lagging subscriber
//! loses its oldest events, never the engine's throughput), and the status
//! page, which reads the bounded replay window instead of subscribing so a
//! snapshot never races task mutation.

use chrono::{DateTime, Utc};
use cpx_common::protocol::ServedBy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// What happened to a compile task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: u64,
        trace_id: String,
        argv0: Option<String>,
        cwd: String,
    },
    Finished {
        task_id: u64,
        exit_status: i32,
        served_by: ServedBy,
    },
    Cancelled {
        task_id: u64,
    },
    /// Remote branch gave up; the local compiler owns the result.
    FallbackEngaged {
        task_id: u64,
        error_code: &'static str,
    },
    LocalRaceWon {
        task_id: u64,
        exit_status: i32,
    },
    /// The racing local subprocess was killed because remote won.
    LocalKilled {
        task_id: u64,
    },
    VerifyMismatch {
        task_id: u64,
        output: String,
    },
    OutputCacheHit {
        task_id: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> u64 {
        match self {
            TaskEvent::Started { task_id, .. }
            | TaskEvent::Finished { task_id, .. }
            | TaskEvent::Cancelled { task_id }
            | TaskEvent::FallbackEngaged { task_id, .. }
            | TaskEvent::LocalRaceWon { task_id, .. }
            | TaskEvent::LocalKilled { task_id }
            | TaskEvent::VerifyMismatch { task_id, .. }
            | TaskEvent::OutputCacheHit { task_id } => *task_id,
        }
    }
}

/// A published event with its position in the stream.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TaskEvent,
}

/// Ordered event stream with a bounded replay window.
pub struct TaskEventLog {
    live: broadcast::Sender<EventRecord>,
    recent: Mutex<VecDeque<EventRecord>>,
    window: usize,
    next_seq: AtomicU64,
}

impl TaskEventLog {
    /// `window` bounds both the replay buffer and the per-subscriber
    /// backlog.
    pub fn new(window: usize) -> Self {
        let window = window.max(16);
        let (live, _) = broadcast::channel(window);
        Self {
            live,
            recent: Mutex::new(VecDeque::with_capacity(window)),
            window,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Record an event; returns its sequence number. Never blocks.
    pub fn publish(&self, event: TaskEvent) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = EventRecord {
            seq,
            at: Utc::now(),
            event,
        };
        {
            let mut recent = self.recent.lock().expect("event window lock");
            if recent.len() == self.window {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }
        // No subscribers is the common case; the send result is noise.
        let _ = self.live.send(record);
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.live.subscribe()
    }

    /// Copy of the replay window, oldest first.
    pub fn recent(&self) -> Vec<EventRecord> {
        self.recent
            .lock()
            .expect("event window lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Sequence number the next publish will use.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(task_id: u64) -> TaskEvent {
        TaskEvent::Started {
            task_id,
            trace_id: format!("trace-{task_id}"),
            argv0: Some("gcc".to_string()),
            cwd: "/src".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_seq_and_delivers() {
        let log = TaskEventLog::new(32);
        let mut rx = log.subscribe();

        let s1 = log.publish(started(1));
        let s2 = log.publish(TaskEvent::Cancelled { task_id: 1 });
        assert!(s2 > s1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, s1);
        assert_eq!(first.event.task_id(), 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, s2);
        assert!(matches!(second.event, TaskEvent::Cancelled { task_id: 1 }));
    }

    #[test]
    fn test_replay_window_trims_oldest() {
        let log = TaskEventLog::new(16);
        for id in 0..40 {
            log.publish(started(id));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 16);
        assert_eq!(recent.first().unwrap().event.task_id(), 24);
        assert_eq!(recent.last().unwrap().event.task_id(), 39);
        // Sequence numbers keep counting past the window.
        assert_eq!(log.next_seq(), 41);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let log = TaskEventLog::new(16);
        log.publish(TaskEvent::OutputCacheHit { task_id: 9 });
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn test_record_serialises_with_kind_tag() {
        let log = TaskEventLog::new(16);
        log.publish(TaskEvent::VerifyMismatch {
            task_id: 3,
            output: "a.o".to_string(),
        });
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["kind"], "verify_mismatch");
        assert_eq!(json["task_id"], 3);
        assert_eq!(json["output"], "a.o");
        assert_eq!(json["seq"], 1);
        assert!(json["at"].is_string());
    }

    #[test]
    fn test_finished_event_carries_serving_branch() {
        let log = TaskEventLog::new(16);
        log.publish(TaskEvent::Finished {
            task_id: 5,
            exit_status: 0,
            served_by: ServedBy::Remote,
        });
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["kind"], "finished");
        assert_eq!(json["served_by"], "remote");
    }
}
