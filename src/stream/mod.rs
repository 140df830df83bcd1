//! Per-run fan-out of output events with resumable replay.
//!
//! Every message published for a run gets the next id from a per-run
//! counter, including messages that are not stored. Resumable messages are
//! appended to the run's log, which keeps the most recent
//! [`DEFAULT_LOG_LIMIT`] entries. Control messages are also buffered so a
//! subscriber arriving late still learns that the run finished.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Resumable messages kept per run before the oldest are dropped.
pub const DEFAULT_LOG_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Done,
    Interrupt,
    Rollback,
}

impl ControlSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlSignal::Done => "done",
            ControlSignal::Interrupt => "interrupt",
            ControlSignal::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Topic {
    /// Output on a named stream mode, e.g. `values` or `messages/partial`.
    Stream(String),
    Control(ControlSignal),
}

/// One event in a run's output sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub id: u64,
    pub topic: Topic,
    pub payload: Value,
}

impl StreamMessage {
    pub fn is_done(&self) -> bool {
        self.topic == Topic::Control(ControlSignal::Done)
    }

    /// The stream mode, or `None` for control messages.
    pub fn mode(&self) -> Option<&str> {
        match &self.topic {
            Topic::Stream(mode) => Some(mode),
            Topic::Control(_) => None,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<StreamMessage>,
}

#[derive(Debug, Default)]
struct RunChannel {
    next_id: u64,
    next_subscriber: u64,
    log: VecDeque<StreamMessage>,
    control: Vec<StreamMessage>,
    subscribers: Vec<Subscriber>,
    concluded: bool,
}

impl RunChannel {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn deliver(&mut self, message: &StreamMessage) {
        self.subscribers
            .retain(|sub| sub.tx.send(message.clone()).is_ok());
    }

    /// Nothing left to serve: no listeners and either finished or never used.
    fn releasable(&self) -> bool {
        self.subscribers.is_empty() && (self.concluded || self.next_id == 0)
    }
}

type Channels = Arc<Mutex<HashMap<Uuid, RunChannel>>>;

fn lock(channels: &Channels) -> MutexGuard<'_, HashMap<Uuid, RunChannel>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live handle on a run's output. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    run_id: Uuid,
    id: u64,
    rx: UnboundedReceiverStream<StreamMessage>,
    channels: Channels,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.next().await
    }
}

impl Stream for Subscription {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = lock(&self.channels);
        if let Some(channel) = channels.get_mut(&self.run_id) {
            channel.subscribers.retain(|sub| sub.id != self.id);
            if channel.releasable() {
                channels.remove(&self.run_id);
            }
        }
    }
}

/// Fan-out hub for run output.
#[derive(Debug, Clone)]
pub struct StreamManager {
    channels: Channels,
    log_limit: usize,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self::with_log_limit(DEFAULT_LOG_LIMIT)
    }

    /// A manager whose per-run replay log holds at most `limit` messages.
    pub fn with_log_limit(limit: usize) -> Self {
        Self {
            channels: Channels::default(),
            log_limit: limit.max(1),
        }
    }

    /// Publishes a payload on a stream mode and returns its id.
    pub fn publish(&self, run_id: Uuid, mode: &str, payload: Value, resumable: bool) -> u64 {
        let mut channels = lock(&self.channels);
        let channel = channels.entry(run_id).or_default();
        let message = StreamMessage {
            id: channel.allocate(),
            topic: Topic::Stream(mode.to_string()),
            payload,
        };
        channel.deliver(&message);
        let id = message.id;
        if resumable {
            if channel.log.len() >= self.log_limit {
                channel.log.pop_front();
            }
            channel.log.push_back(message);
        }
        id
    }

    /// Publishes a control signal on a tracked run. Control messages are
    /// always buffered.
    ///
    /// Returns `None` when the run has no state left, e.g. after it
    /// concluded and its last subscriber went away.
    pub fn control(&self, run_id: Uuid, signal: ControlSignal) -> Option<u64> {
        let mut channels = lock(&self.channels);
        let channel = channels.get_mut(&run_id)?;
        Some(Self::push_control(channel, signal))
    }

    fn push_control(channel: &mut RunChannel, signal: ControlSignal) -> u64 {
        let message = StreamMessage {
            id: channel.allocate(),
            topic: Topic::Control(signal),
            payload: Value::String(signal.as_str().to_string()),
        };
        channel.deliver(&message);
        let id = message.id;
        channel.control.push(message);
        id
    }

    /// Marks the run finished: publishes `done` and releases the run's
    /// state once nobody is subscribed. An untracked run has nobody to tell.
    pub fn conclude(&self, run_id: Uuid) {
        let mut channels = lock(&self.channels);
        let Some(channel) = channels.get_mut(&run_id) else {
            return;
        };
        Self::push_control(channel, ControlSignal::Done);
        channel.concluded = true;
        if channel.releasable() {
            channels.remove(&run_id);
        }
    }

    /// Subscribes to live output. Buffered control messages are delivered
    /// first.
    pub fn subscribe(&self, run_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = lock(&self.channels);
        let channel = channels.entry(run_id).or_default();
        for message in &channel.control {
            // The receiver is alive; it is returned below.
            let _ = tx.send(message.clone());
        }
        let id = channel.next_subscriber;
        channel.next_subscriber += 1;
        channel.subscribers.push(Subscriber { id, tx });
        Subscription {
            run_id,
            id,
            rx: UnboundedReceiverStream::new(rx),
            channels: Arc::clone(&self.channels),
        }
    }

    /// Stored messages with an id greater than `after`, in id order.
    pub fn replay(&self, run_id: Uuid, after: u64) -> Vec<StreamMessage> {
        lock(&self.channels)
            .get(&run_id)
            .map(|channel| {
                channel
                    .log
                    .iter()
                    .filter(|m| m.id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any state is still held for the run.
    pub fn is_tracked(&self, run_id: Uuid) -> bool {
        lock(&self.channels).contains_key(&run_id)
    }

    /// Replays from `last_event_id` (when given) and then follows live
    /// output until `done`, without duplicates.
    ///
    /// `interrupt` and `rollback` signals are forwarded; `done` ends the
    /// stream.
    pub fn join(
        &self,
        run_id: Uuid,
        last_event_id: Option<u64>,
    ) -> impl Stream<Item = StreamMessage> + Send + 'static {
        let mut subscription = self.subscribe(run_id);
        let replayed = last_event_id
            .map(|after| self.replay(run_id, after))
            .unwrap_or_default();

        async_stream::stream! {
            let mut last_seen = last_event_id;
            for message in replayed {
                last_seen = Some(message.id);
                yield message;
            }
            while let Some(message) = subscription.recv().await {
                if message.is_done() {
                    break;
                }
                if last_seen.is_some_and(|seen| message.id <= seen) {
                    continue;
                }
                last_seen = Some(message.id);
                yield message;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_shared_across_resumable_and_control_messages() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        assert_eq!(streams.publish(run, "values", json!(1), true), 0);
        assert_eq!(streams.publish(run, "values", json!(2), false), 1);
        assert_eq!(streams.control(run, ControlSignal::Interrupt), Some(2));
        assert_eq!(streams.publish(run, "values", json!(3), true), 3);

        let ids: Vec<u64> = streams.replay(run, 0).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        let mut a = streams.subscribe(run);
        let mut b = streams.subscribe(run);
        streams.publish(run, "updates", json!({"n": 1}), false);

        assert_eq!(a.recv().await.unwrap().payload, json!({"n": 1}));
        assert_eq!(b.recv().await.unwrap().payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn resumes_after_last_seen_id() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();

        let mut first = Box::pin(streams.join(run, None));
        for n in 0..5 {
            streams.publish(run, "values", json!(n), true);
        }
        let seen: Vec<u64> = (&mut first).take(3).map(|m| m.id).collect().await;
        assert_eq!(seen, vec![0, 1, 2]);
        drop(first);

        let mut resumed = Box::pin(streams.join(run, Some(2)));
        streams.publish(run, "values", json!(5), true);
        streams.conclude(run);

        let rest: Vec<u64> = resumed.by_ref().map(|m| m.id).collect().await;
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn late_subscriber_learns_run_is_done() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        let _holder = streams.subscribe(run);
        streams.publish(run, "values", json!("v"), true);
        streams.conclude(run);

        let late: Vec<StreamMessage> = streams.join(run, None).collect().await;
        assert!(late.is_empty());

        let replayed: Vec<StreamMessage> = streams.join(run, Some(0)).collect().await;
        assert!(replayed.is_empty());
    }

    #[test]
    fn state_is_released_after_conclusion_and_last_unsubscribe() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        let sub = streams.subscribe(run);
        streams.publish(run, "values", json!(1), true);
        drop(sub);
        assert!(streams.is_tracked(run), "unfinished runs keep their log");

        let sub = streams.subscribe(run);
        streams.conclude(run);
        assert!(streams.is_tracked(run));
        drop(sub);
        assert!(!streams.is_tracked(run));
    }

    #[test]
    fn conclude_without_subscribers_releases_immediately() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        streams.publish(run, "values", json!(1), true);
        streams.conclude(run);
        assert!(!streams.is_tracked(run));
    }

    #[test]
    fn signals_after_release_do_not_revive_the_run() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        streams.publish(run, "values", json!(1), true);
        streams.publish(run, "values", json!(2), true);
        streams.conclude(run);
        assert!(!streams.is_tracked(run));

        assert_eq!(streams.control(run, ControlSignal::Rollback), None);
        streams.conclude(run);
        assert!(!streams.is_tracked(run));
    }

    #[test]
    fn replay_log_keeps_only_the_newest_messages() {
        let streams = StreamManager::with_log_limit(3);
        let run = Uuid::new_v4();
        for n in 0..5 {
            streams.publish(run, "values", json!(n), true);
        }
        streams.publish(run, "updates", json!("live"), false);
        assert_eq!(streams.publish(run, "values", json!(6), true), 6);

        let ids: Vec<u64> = streams.replay(run, 0).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 6]);
    }

    #[tokio::test]
    async fn join_forwards_cancel_signals_before_done() {
        let streams = StreamManager::new();
        let run = Uuid::new_v4();
        let joined = streams.join(run, None);
        streams.publish(run, "values", json!(1), true);
        streams.control(run, ControlSignal::Interrupt);
        streams.conclude(run);

        let topics: Vec<Topic> = joined.map(|m| m.topic).collect().await;
        assert_eq!(
            topics,
            vec![
                Topic::Stream("values".to_string()),
                Topic::Control(ControlSignal::Interrupt),
            ]
        );
    }
}
