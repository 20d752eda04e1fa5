//! The single-writer actor owning one rate limit key.
//!
//! All mutation of a key's bucket flows through its actor's event loop, so
//! there are no concurrent-writer races to guard against. The actor caches
//! its state in memory after the first storage load and keeps the persisted
//! copy fresh with a self-rescheduling refill alarm.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::bucket::{self, BucketState};
use crate::clock::Clock;
use crate::error::Result;

use super::protocol::{BucketAction, BucketRequest, BucketResponse};
use super::storage::BucketStorage;

/// A request paired with its reply channel.
pub(crate) struct Envelope {
    pub(crate) request: BucketRequest,
    pub(crate) reply: oneshot::Sender<BucketResponse>,
}

/// The store's map of live actor handles; an actor removes its own entry
/// when it retires.
pub(crate) type ActorRegistry = Arc<DashMap<String, mpsc::Sender<Envelope>>>;

/// Idle bound for an actor that has not yet loaded any bucket state.
const DEFAULT_IDLE: Duration = Duration::from_secs(120);

pub(crate) struct BucketActor {
    key: String,
    registry: Weak<DashMap<String, mpsc::Sender<Envelope>>>,
    storage: Arc<dyn BucketStorage>,
    clock: Arc<dyn Clock>,
    state: Option<BucketState>,
    hydrated: bool,
    /// Timestamp of the pending refill alarm, at most one at a time.
    alarm_at: Option<u64>,
}

impl BucketActor {
    /// Spawn an actor and return the sender half of its inbox.
    pub(crate) fn spawn(
        key: String,
        registry: Weak<DashMap<String, mpsc::Sender<Envelope>>>,
        storage: Arc<dyn BucketStorage>,
        clock: Arc<dyn Clock>,
        inbox_capacity: usize,
    ) -> mpsc::Sender<Envelope> {
        let (tx, rx) = mpsc::channel(inbox_capacity);
        let actor = Self {
            key,
            registry,
            storage,
            clock,
            state: None,
            hydrated: false,
            alarm_at: None,
        };
        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) {
        loop {
            match self.alarm_at {
                Some(at) => {
                    let delay = at.saturating_sub(self.clock.now_ms());
                    tokio::select! {
                        envelope = inbox.recv() => match envelope {
                            Some(envelope) => self.handle(envelope).await,
                            None => break,
                        },
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                            self.on_alarm().await;
                        }
                    }
                }
                // No alarm pending means the bucket is full (or untouched):
                // wait for traffic, but only for so long before retiring.
                None => match tokio::time::timeout(self.idle_timeout(), inbox.recv()).await {
                    Ok(Some(envelope)) => self.handle(envelope).await,
                    Ok(None) => break,
                    Err(_) => {
                        self.retire(&mut inbox).await;
                        break;
                    }
                },
            }
        }
        trace!(key = %self.key, "Bucket actor stopped");
    }

    /// How long to sit idle before retiring: twice the bucket's window,
    /// matching the local store's sweep bound.
    fn idle_timeout(&self) -> Duration {
        match self.state {
            Some(state) => Duration::from_millis(2 * state.window_ms),
            None => DEFAULT_IDLE,
        }
    }

    /// Deregister, then drain any requests that raced the shutdown before
    /// dropping the inbox. A later request for this key spawns a fresh
    /// actor, which rehydrates from storage.
    async fn retire(&mut self, inbox: &mut mpsc::Receiver<Envelope>) {
        if let Some(actors) = self.registry.upgrade() {
            actors.remove(&self.key);
        }
        inbox.close();
        while let Some(envelope) = inbox.recv().await {
            self.handle(envelope).await;
        }
        trace!(key = %self.key, "Bucket actor retired after idle window");
    }

    async fn handle(&mut self, envelope: Envelope) {
        let response = match self.process(envelope.request).await {
            Ok(response) => response,
            Err(err) => {
                // Availability over precise enforcement: internal faults
                // never surface as errors to the caller.
                warn!(key = %self.key, error = %err, "Bucket actor fault, failing open");
                BucketResponse::fail_open()
            }
        };
        let _ = envelope.reply.send(response);
    }

    async fn hydrate(&mut self) -> Result<()> {
        if !self.hydrated {
            self.state = self.storage.load(&self.key).await?;
            self.hydrated = true;
        }
        Ok(())
    }

    async fn process(&mut self, request: BucketRequest) -> Result<BucketResponse> {
        self.hydrate().await?;
        let now = self.clock.now_ms();

        match request.action {
            BucketAction::Check => {
                let (next, result) =
                    bucket::attempt(self.state.as_ref(), request.limit, request.window_ms, now);
                self.storage.save(&self.key, &next).await?;
                self.state = Some(next);
                if !next.is_full() && self.alarm_at.is_none() {
                    self.alarm_at = Some(now + request.window_ms);
                }
                Ok(result.into())
            }
            BucketAction::Get => Ok(bucket::peek(
                self.state.as_ref(),
                request.limit,
                request.window_ms,
                now,
            )
            .into()),
        }
    }

    /// Refill alarm: top up the persisted state as of now, and reschedule
    /// only while the bucket is not yet full. The rule parameters come from
    /// the persisted state, since no request is in flight.
    async fn on_alarm(&mut self) {
        self.alarm_at = None;
        let Some(current) = self.state else {
            return;
        };

        let now = self.clock.now_ms();
        let refilled = bucket::refill(Some(&current), current.limit, current.window_ms, now);
        if let Err(err) = self.storage.save(&self.key, &refilled).await {
            warn!(key = %self.key, error = %err, "Failed to persist alarm refill");
        }
        self.state = Some(refilled);

        if !refilled.is_full() {
            self.alarm_at = Some(now + current.window_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FloodgateError;
    use crate::store::partitioned::storage::MemoryStorage;
    use async_trait::async_trait;

    fn check(limit: u32, window_ms: u64) -> BucketRequest {
        BucketRequest {
            action: BucketAction::Check,
            limit,
            window_ms,
        }
    }

    fn test_actor(storage: Arc<dyn BucketStorage>, clock: ManualClock) -> BucketActor {
        BucketActor {
            key: "k".to_string(),
            registry: Weak::new(),
            storage,
            clock: Arc::new(clock),
            state: None,
            hydrated: false,
            alarm_at: None,
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl BucketStorage for FailingStorage {
        async fn load(&self, _key: &str) -> Result<Option<BucketState>> {
            Err(FloodgateError::Storage("disk on fire".to_string()))
        }

        async fn save(&self, _key: &str, _state: &BucketState) -> Result<()> {
            Err(FloodgateError::Storage("disk on fire".to_string()))
        }
    }

    #[tokio::test]
    async fn test_check_persists_and_schedules_one_alarm() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_at(0);
        let mut actor = test_actor(storage.clone(), clock);

        let response = actor.process(check(5, 60_000)).await.unwrap();
        assert!(response.allowed);
        assert_eq!(response.remaining, 4);
        assert_eq!(actor.alarm_at, Some(60_000));
        assert_eq!(storage.load("k").await.unwrap().unwrap().tokens, 4.0);

        // A second check must not pile up another alarm.
        actor.process(check(5, 60_000)).await.unwrap();
        assert_eq!(actor.alarm_at, Some(60_000));
    }

    #[tokio::test]
    async fn test_get_never_persists_or_schedules() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_at(0);
        let mut actor = test_actor(storage.clone(), clock);

        let response = actor
            .process(BucketRequest {
                action: BucketAction::Get,
                limit: 5,
                window_ms: 60_000,
            })
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(response.remaining, 4);

        assert_eq!(actor.alarm_at, None);
        assert_eq!(storage.load("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_alarm_refills_and_stops_when_full() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_at(0);
        let mut actor = test_actor(storage.clone(), clock.clone());

        actor.process(check(2, 1_000)).await.unwrap();
        actor.process(check(2, 1_000)).await.unwrap();
        assert_eq!(actor.alarm_at, Some(1_000));

        // One full window elapses: the alarm restores the bucket and stops.
        clock.set(1_000);
        actor.on_alarm().await;
        assert_eq!(storage.load("k").await.unwrap().unwrap().tokens, 2.0);
        assert_eq!(actor.alarm_at, None);
    }

    #[tokio::test]
    async fn test_alarm_reschedules_while_not_full() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_at(0);
        let mut actor = test_actor(storage.clone(), clock.clone());

        actor.process(check(2, 1_000)).await.unwrap();
        actor.process(check(2, 1_000)).await.unwrap();

        // A quarter window: only half a token back, so the alarm must rearm.
        clock.set(250);
        actor.on_alarm().await;
        assert_eq!(storage.load("k").await.unwrap().unwrap().tokens, 0.5);
        assert_eq!(actor.alarm_at, Some(1_250));
    }

    #[tokio::test]
    async fn test_storage_fault_fails_open() {
        let clock = ManualClock::starting_at(0);
        let mut actor = test_actor(Arc::new(FailingStorage), clock);

        let (reply, rx) = oneshot::channel();
        actor
            .handle(Envelope {
                request: check(5, 60_000),
                reply,
            })
            .await;

        let response = rx.await.unwrap();
        assert_eq!(response, BucketResponse::fail_open());
        assert!(response.allowed);
        assert_eq!(response.remaining, 0);
        assert_eq!(response.limit, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_actor_deregisters_itself() {
        let actors: ActorRegistry = Arc::new(DashMap::new());
        let tx = BucketActor::spawn(
            "k".to_string(),
            Arc::downgrade(&actors),
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::starting_at(0)),
            4,
        );
        actors.insert("k".to_string(), tx.clone());

        let (reply, rx) = oneshot::channel();
        tx.send(Envelope {
            request: BucketRequest {
                action: BucketAction::Get,
                limit: 5,
                window_ms: 60_000,
            },
            reply,
        })
        .await
        .unwrap();
        rx.await.unwrap();

        // Paused time jumps past the idle bound; the actor removes its own
        // map entry and drops its inbox on the way out.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(actors.get("k").is_none());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_rehydrates_persisted_state() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_at(0);

        // First actor lifetime drains the bucket.
        let mut actor = test_actor(storage.clone(), clock.clone());
        actor.process(check(1, 60_000)).await.unwrap();

        // A fresh lifetime sheds the cache but rehydrates from storage.
        let mut actor = test_actor(storage, clock);
        let response = actor.process(check(1, 60_000)).await.unwrap();
        assert!(!response.allowed);
    }
}
