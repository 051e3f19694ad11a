//! SQLite-backed ingestion queue.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::db::queue_repo::{self, DeadLetterRow};
use crate::db::{now_millis, Database};

use super::error::QueueError;
use super::{
    AdmissionMessage, DeadLetter, Delivery, DeliveryToken, IngestionQueue, QueueDepth,
    DEAD_LETTER_THRESHOLD,
};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn dead_letter_from_row(row: DeadLetterRow) -> DeadLetter {
    DeadLetter {
        message: serde_json::from_str(&row.body).ok(),
        message_id: row.message_id,
        job_id: row.job_id,
        raw_body: row.body,
        receive_count: row.receive_count,
        enqueued_at: millis_to_datetime(row.enqueued_at),
        dead_lettered_at: millis_to_datetime(row.dead_lettered_at),
    }
}

/// Queue whose messages live in the `queue_messages` table.
///
/// Safe to share between threads and between processes using the same
/// database file.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
    max_receive_count: u32,
    visibility_timeout: Duration,
    poll_interval: Duration,
    capacity: Option<u64>,
}

impl SqliteQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            max_receive_count: DEAD_LETTER_THRESHOLD,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            capacity: None,
        }
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bounds the number of queued messages; `enqueue` fails with
    /// `Unavailable` once the bound is reached.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// One non-blocking dequeue attempt. Dead-letters every message at the
    /// head of the queue that has used up its deliveries or cannot be
    /// decoded.
    fn try_dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let max_receive_count = self.max_receive_count;
        let visibility_ms = self.visibility_timeout.as_millis() as i64;

        self.db.with_transaction(|conn| loop {
            let now = now_millis();
            let Some(row) = queue_repo::next_visible(conn, now)? else {
                return Ok(None);
            };

            if row.receive_count >= max_receive_count {
                log::warn!(
                    "Dead-lettering message {} for job {} after {} deliveries",
                    row.message_id,
                    row.job_id,
                    row.receive_count
                );
                queue_repo::move_to_dead_letter(conn, &row, now)?;
                continue;
            }

            let message: AdmissionMessage = match serde_json::from_str(&row.body) {
                Ok(message) => message,
                Err(e) => {
                    log::error!(
                        "Dead-lettering undecodable message {}: {}",
                        row.message_id,
                        e
                    );
                    queue_repo::move_to_dead_letter(conn, &row, now)?;
                    continue;
                }
            };

            let receipt = Uuid::new_v4().to_string();
            queue_repo::mark_received(
                conn,
                &row.message_id,
                &receipt,
                now.saturating_add(visibility_ms),
            )?;

            return Ok(Some(Delivery {
                message,
                token: DeliveryToken {
                    message_id: row.message_id,
                    receipt,
                },
                receive_count: row.receive_count + 1,
            }));
        })
    }

    /// Explains why a token matched nothing.
    fn stale_token_error(&self, token: &DeliveryToken) -> QueueError {
        let dead = self
            .db
            .with_conn(|conn| queue_repo::find_dead_letter(conn, &token.message_id));
        match dead {
            Ok(Some(row)) => QueueError::DeadLettered {
                message_id: row.message_id,
                receive_count: row.receive_count,
            },
            _ => QueueError::InvalidToken {
                message_id: token.message_id.clone(),
            },
        }
    }
}

impl IngestionQueue for SqliteQueue {
    fn enqueue(&self, message: &AdmissionMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(message)?;
        let message_id = Uuid::new_v4().to_string();
        let capacity = self.capacity;

        let result: Result<(), QueueError> = self.db.with_transaction(|conn| {
            if let Some(capacity) = capacity {
                let (visible, in_flight, _) = queue_repo::depth(conn, now_millis())?;
                if visible + in_flight >= capacity {
                    return Err(QueueError::Unavailable(format!(
                        "queue is full ({} messages)",
                        capacity
                    )));
                }
            }
            queue_repo::insert(conn, &message_id, &message.job_id, &body, now_millis())?;
            Ok(())
        });

        match result {
            Ok(()) => {
                log::debug!("Enqueued message {} for job {}", message_id, message.job_id);
                Ok(message_id)
            }
            Err(QueueError::Database(e)) => Err(QueueError::Unavailable(e.to_string())),
            Err(e) => Err(e),
        }
    }

    fn dequeue(&self, poll_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + poll_timeout;
        loop {
            if let Some(delivery) = self.try_dequeue()? {
                log::debug!(
                    "Delivered message {} for job {} (delivery {})",
                    delivery.token.message_id,
                    delivery.message.job_id,
                    delivery.receive_count
                );
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn ack(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        let deleted = self.db.with_conn(|conn| {
            queue_repo::delete_by_receipt(conn, &token.message_id, &token.receipt)
        })?;
        if deleted == 0 {
            return Err(self.stale_token_error(token));
        }
        Ok(())
    }

    fn release(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        let released = self.db.with_conn(|conn| {
            queue_repo::release_by_receipt(conn, &token.message_id, &token.receipt, now_millis())
        })?;
        if released == 0 {
            return Err(self.stale_token_error(token));
        }
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = self.db.with_conn(queue_repo::dead_letters)?;
        Ok(rows.into_iter().map(dead_letter_from_row).collect())
    }

    fn replay_dead_letter(&self, message_id: &str) -> Result<(), QueueError> {
        self.db.with_transaction(|conn| {
            let row = queue_repo::find_dead_letter(conn, message_id)?
                .ok_or_else(|| QueueError::NotFound(message_id.to_string()))?;
            queue_repo::delete_dead_letter(conn, message_id)?;
            queue_repo::insert(conn, &row.message_id, &row.job_id, &row.body, now_millis())?;
            Ok::<_, QueueError>(())
        })?;

        log::info!("Replayed dead letter {}", message_id);
        Ok(())
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        let (visible, in_flight, dead_lettered) = self
            .db
            .with_conn(|conn| queue_repo::depth(conn, now_millis()))?;
        Ok(QueueDepth {
            visible,
            in_flight,
            dead_lettered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InputParams;

    fn test_queue() -> (Database, SqliteQueue) {
        let db = Database::open_in_memory().unwrap();
        let queue = SqliteQueue::new(db.clone()).with_poll_interval(Duration::from_millis(5));
        (db, queue)
    }

    fn message(job_id: &str) -> AdmissionMessage {
        AdmissionMessage::new(job_id, "user-1", InputParams::new("raw/user-1/a.csv"))
    }

    #[test]
    fn test_enqueue_dequeue_ack() {
        let (_db, queue) = test_queue();
        queue.enqueue(&message("j1")).unwrap();

        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(delivery.message.job_id, "j1");
        assert_eq!(delivery.receive_count, 1);

        queue.ack(&delivery.token).unwrap();
        assert_eq!(queue.depth().unwrap(), QueueDepth::default());
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_in_flight_message_is_hidden() {
        let (_db, queue) = test_queue();
        queue.enqueue(&message("j1")).unwrap();

        let _delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_millis(20)).unwrap().is_none());

        let depth = queue.depth().unwrap();
        assert_eq!(depth.in_flight, 1);
        assert_eq!(depth.visible, 0);
    }

    #[test]
    fn test_release_makes_message_visible_again() {
        let (_db, queue) = test_queue();
        queue.enqueue(&message("j1")).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        queue.release(&first.token).unwrap();

        let second = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.token, second.token);
    }

    #[test]
    fn test_stale_token_is_rejected() {
        let (_db, queue) = test_queue();
        let queue = queue.with_visibility_timeout(Duration::ZERO);
        queue.enqueue(&message("j1")).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).unwrap().unwrap();

        assert!(matches!(
            queue.ack(&first.token),
            Err(QueueError::InvalidToken { .. })
        ));
        queue.ack(&second.token).unwrap();
    }

    #[test]
    fn test_dead_letter_after_threshold() {
        let (_db, queue) = test_queue();
        let queue = queue.with_visibility_timeout(Duration::ZERO);
        queue.enqueue(&message("j1")).unwrap();

        let mut last = None;
        for expected in 1..=DEAD_LETTER_THRESHOLD {
            let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();
            assert_eq!(delivery.receive_count, expected);
            last = Some(delivery);
        }

        // The fourth delivery would exceed the threshold.
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());

        let letters = queue.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, "j1");
        assert_eq!(letters[0].receive_count, DEAD_LETTER_THRESHOLD);
        assert_eq!(letters[0].message.as_ref().unwrap().job_id, "j1");

        let err = queue.ack(&last.unwrap().token).unwrap_err();
        assert!(matches!(err, QueueError::DeadLettered { .. }));
    }

    #[test]
    fn test_replay_dead_letter_resets_count() {
        let (_db, queue) = test_queue();
        let queue = queue
            .with_visibility_timeout(Duration::ZERO)
            .with_max_receive_count(1);
        let id = queue.enqueue(&message("j1")).unwrap();

        queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());
        assert_eq!(queue.depth().unwrap().dead_lettered, 1);

        queue.replay_dead_letter(&id).unwrap();
        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(delivery.receive_count, 1);
        assert_eq!(delivery.token.message_id, id);
        assert_eq!(queue.depth().unwrap().dead_lettered, 0);

        assert!(matches!(
            queue.replay_dead_letter("missing"),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_undecodable_message_goes_straight_to_dead_letter() {
        let (db, queue) = test_queue();
        db.with_conn(|conn| queue_repo::insert(conn, "bad", "j?", "not json", 0))
            .unwrap();

        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());
        let letters = queue.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].message.is_none());
        assert_eq!(letters[0].raw_body, "not json");
    }

    #[test]
    fn test_full_queue_is_unavailable() {
        let (_db, queue) = test_queue();
        let queue = queue.with_capacity(1);
        queue.enqueue(&message("j1")).unwrap();

        let err = queue.enqueue(&message("j2")).unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
    }

    #[test]
    fn test_dequeue_waits_for_late_message() {
        let (_db, queue) = test_queue();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(&message("late")).unwrap();
        });

        let delivery = queue.dequeue(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(delivery.unwrap().message.job_id, "late");
    }
}
