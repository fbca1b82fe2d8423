//! In-memory queue broker.
//!
//! Single-process only; every pointer is lost on restart, which the
//! dispatcher's reconciliation sweep repairs from the job store.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    BrokerResult, DeadLetter, Delivery, EnqueueOptions, Pointer, QueueBroker, QueueCounts,
    DEFAULT_DEAD_LETTER_LIMIT, MAX_PRIORITY,
};

struct Entry {
    job_id: Uuid,
    priority: i32,
    attempts: u32,
}

#[derive(Default)]
struct BrokerState {
    seq: u64,
    entries: HashMap<String, Entry>,
    /// (priority, enqueue sequence, broker id)
    waiting: BTreeSet<(i32, u64, String)>,
    /// (ready at, enqueue sequence, broker id)
    delayed: BTreeSet<(DateTime<Utc>, u64, String)>,
    /// broker id -> (visibility deadline, attempt that owns it)
    active: HashMap<String, (DateTime<Utc>, u32)>,
    index: HashMap<Uuid, String>,
    /// Oldest first
    dead: VecDeque<DeadLetter>,
    completed: u64,
}

impl BrokerState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_waiting(&mut self, id: &str) {
        let priority = self.entries.get(id).map(|e| e.priority).unwrap_or(MAX_PRIORITY);
        let seq = self.next_seq();
        self.waiting.insert((priority, seq, id.to_string()));
    }

    fn push_delayed(&mut self, id: &str, ready_at: DateTime<Utc>) {
        let seq = self.next_seq();
        self.delayed.insert((ready_at, seq, id.to_string()));
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<_> = self
            .delayed
            .iter()
            .take_while(|(ready_at, _, _)| *ready_at <= now)
            .cloned()
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.push_waiting(&key.2);
        }
    }

    /// Drop an entry from every set and the job index.
    fn forget(&mut self, id: &str) -> Option<Entry> {
        self.active.remove(id);
        self.waiting.retain(|(_, _, waiting_id)| waiting_id != id);
        self.delayed.retain(|(_, _, delayed_id)| delayed_id != id);
        let entry = self.entries.remove(id)?;
        if self.index.get(&entry.job_id).map(String::as_str) == Some(id) {
            self.index.remove(&entry.job_id);
        }
        Some(entry)
    }
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    dead_letter_limit: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_dead_letter_limit(DEFAULT_DEAD_LETTER_LIMIT)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dead_letter_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            dead_letter_limit: limit.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, pointer: Pointer, options: EnqueueOptions) -> BrokerResult<String> {
        let mut state = self.state();
        if let Some(existing) = state.index.get(&pointer.job_id) {
            return Ok(existing.clone());
        }

        let id = Uuid::new_v4().simple().to_string();
        state.entries.insert(
            id.clone(),
            Entry {
                job_id: pointer.job_id,
                priority: options.priority.clamp(0, MAX_PRIORITY),
                attempts: 0,
            },
        );
        state.index.insert(pointer.job_id, id.clone());

        match options.delay_until {
            Some(ready_at) if ready_at > Utc::now() => state.push_delayed(&id, ready_at),
            _ => state.push_waiting(&id),
        }
        Ok(id)
    }

    async fn reserve(&self, visibility_timeout: Duration) -> BrokerResult<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state();
        state.promote_due(now);

        let Some(key) = state.waiting.pop_first() else {
            return Ok(None);
        };
        let id = key.2;

        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.attempts += 1;
        let delivery = Delivery {
            broker_id: id.clone(),
            pointer: Pointer {
                job_id: entry.job_id,
            },
            attempt: entry.attempts,
            priority: entry.priority,
        };

        let visibility = chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        state.active.insert(id, (now + visibility, delivery.attempt));
        Ok(Some(delivery))
    }

    async fn extend(
        &self,
        delivery: &Delivery,
        visibility_timeout: Duration,
    ) -> BrokerResult<bool> {
        let mut state = self.state();
        match state.active.get_mut(&delivery.broker_id) {
            Some((deadline, attempt)) if *attempt == delivery.attempt => {
                let visibility = chrono::Duration::from_std(visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                *deadline = Utc::now() + visibility;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut state = self.state();
        if state.forget(&delivery.broker_id).is_some() {
            state.completed += 1;
        }
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> BrokerResult<bool> {
        let mut state = self.state();
        let owned = matches!(
            state.active.get(&delivery.broker_id),
            Some((_, attempt)) if *attempt == delivery.attempt
        );
        if !owned {
            return Ok(false);
        }
        state.active.remove(&delivery.broker_id);

        if delay.is_zero() {
            state.push_waiting(&delivery.broker_id);
        } else {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            state.push_delayed(&delivery.broker_id, Utc::now() + delay);
        }
        Ok(true)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BrokerResult<()> {
        let mut state = self.state();
        let attempts = state
            .forget(&delivery.broker_id)
            .map(|e| e.attempts)
            .unwrap_or(delivery.attempt);

        state.dead.push_back(DeadLetter {
            broker_id: delivery.broker_id.clone(),
            job_id: delivery.pointer.job_id,
            attempts,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        while state.dead.len() > self.dead_letter_limit {
            state.dead.pop_front();
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> BrokerResult<u64> {
        let now = Utc::now();
        let mut state = self.state();
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.active.remove(id);
            state.push_waiting(id);
        }
        Ok(expired.len() as u64)
    }

    async fn is_tracked(&self, job_id: Uuid) -> BrokerResult<bool> {
        Ok(self.state().index.contains_key(&job_id))
    }

    async fn counts(&self) -> BrokerResult<QueueCounts> {
        let state = self.state();
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> BrokerResult<Vec<DeadLetter>> {
        Ok(self.state().dead.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer() -> Pointer {
        Pointer {
            job_id: Uuid::new_v4(),
        }
    }

    fn opts(priority: i32) -> EnqueueOptions {
        EnqueueOptions {
            priority,
            delay_until: None,
        }
    }

    const VT: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let broker = MemoryBroker::new();
        let (a, b, c) = (pointer(), pointer(), pointer());
        broker.enqueue(a, opts(5)).await.unwrap();
        broker.enqueue(b, opts(1)).await.unwrap();
        broker.enqueue(c, opts(5)).await.unwrap();

        let order: Vec<Uuid> = [
            broker.reserve(VT).await.unwrap().unwrap(),
            broker.reserve(VT).await.unwrap().unwrap(),
            broker.reserve(VT).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|d| d.pointer.job_id)
        .collect();
        assert_eq!(order, vec![b.job_id, a.job_id, c.job_id]);
        assert!(broker.reserve(VT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_deduplicated_per_job() {
        let broker = MemoryBroker::new();
        let p = pointer();
        let first = broker.enqueue(p, opts(1)).await.unwrap();
        let second = broker.enqueue(p, opts(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_delayed_entries_wait_until_due() {
        let broker = MemoryBroker::new();
        let p = pointer();
        broker
            .enqueue(
                p,
                EnqueueOptions {
                    priority: 1,
                    delay_until: Some(Utc::now() + chrono::Duration::hours(1)),
                },
            )
            .await
            .unwrap();

        assert!(broker.reserve(VT).await.unwrap().is_none());
        assert_eq!(broker.counts().await.unwrap().delayed, 1);
        assert!(broker.is_tracked(p.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_increments_attempt() {
        let broker = MemoryBroker::new();
        broker.enqueue(pointer(), opts(1)).await.unwrap();

        let first = broker.reserve(VT).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(broker.retry(&first, Duration::ZERO).await.unwrap());

        let second = broker.reserve(VT).await.unwrap().unwrap();
        assert_eq!(second.broker_id, first.broker_id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivers() {
        let broker = MemoryBroker::new();
        broker.enqueue(pointer(), opts(1)).await.unwrap();

        let stale = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(broker.requeue_expired().await.unwrap(), 1);

        let again = broker.reserve(VT).await.unwrap().unwrap();
        assert_eq!(again.broker_id, stale.broker_id);
        assert_eq!(again.attempt, 2);

        // The stale owner lost its reservation
        assert!(!broker.retry(&stale, Duration::ZERO).await.unwrap());
        assert!(broker.retry(&again, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_and_dead_letter() {
        let broker = MemoryBroker::new();
        let (ok, bad) = (pointer(), pointer());
        broker.enqueue(ok, opts(1)).await.unwrap();
        broker.enqueue(bad, opts(2)).await.unwrap();

        let d1 = broker.reserve(VT).await.unwrap().unwrap();
        broker.complete(&d1).await.unwrap();
        let d2 = broker.reserve(VT).await.unwrap().unwrap();
        broker.dead_letter(&d2, "boom").await.unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
        assert!(!broker.is_tracked(bad.job_id).await.unwrap());

        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].job_id, bad.job_id);
        assert_eq!(dead[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_extend_keeps_reservation_alive() {
        let broker = MemoryBroker::new();
        broker.enqueue(pointer(), opts(1)).await.unwrap();

        let held = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert!(broker.extend(&held, VT).await.unwrap());
        assert_eq!(broker.requeue_expired().await.unwrap(), 0);
        assert!(broker.reserve(VT).await.unwrap().is_none());
        assert!(broker.retry(&held, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_refused_after_redelivery() {
        let broker = MemoryBroker::new();
        broker.enqueue(pointer(), opts(1)).await.unwrap();

        let stale = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        broker.requeue_expired().await.unwrap();
        let current = broker.reserve(VT).await.unwrap().unwrap();

        assert!(!broker.extend(&stale, VT).await.unwrap());
        assert!(broker.extend(&current, VT).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letters_trimmed_to_limit() {
        let broker = MemoryBroker::with_dead_letter_limit(2);
        let mut job_ids = Vec::new();
        for _ in 0..3 {
            let p = pointer();
            job_ids.push(p.job_id);
            broker.enqueue(p, opts(1)).await.unwrap();
            let d = broker.reserve(VT).await.unwrap().unwrap();
            broker.dead_letter(&d, "boom").await.unwrap();
        }

        assert_eq!(broker.counts().await.unwrap().failed, 2);
        let dead: Vec<Uuid> = broker
            .dead_letters(10)
            .await
            .unwrap()
            .iter()
            .map(|d| d.job_id)
            .collect();
        assert_eq!(dead, vec![job_ids[2], job_ids[1]]);
    }
}
