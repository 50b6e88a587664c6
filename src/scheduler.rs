//! # Build Queue
//!
//! Debounces and dedupes manual build requests. Triggers (entity saves,
//! bulk actions, manual rebuilds) enqueue entity ids; a drain pass pops a
//! bounded batch and runs the PDF builder for each entry.
//!
//! Guarantees:
//!
//! - The queue holds at most one entry per entity id. Re-enqueueing keeps
//!   the first position and takes the latest force flag.
//! - At most one drain runs at a time, enforced by a TTL lease that
//!   self-heals if a holder never released it.
//! - Per-entity build failures are logged and never abort the batch.
//! - The queue is persisted to disk on every mutation; entries popped into
//!   a running drain are not re-persisted (at-most-once processing).
//!
//! Entities carrying the lock flag are skipped unless the entry was
//! enqueued with force.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::entity::EntityStore;
use crate::error::LibritoError;
use crate::pdf::PdfBuilder;

/// Queue file name under the data directory.
pub const QUEUE_FILE: &str = "queue.json";

/// Maximum entries processed per drain.
pub const BATCH_SIZE: usize = 25;

/// Drain lease lifetime; a crashed drain frees the queue after this long.
pub const LEASE_TTL_SECS: u64 = 30;

/// Delay before re-draining a queue that still has entries.
pub const RESCHEDULE_DELAY_SECS: u64 = 60;

/// Default enqueue delay for single entity saves.
pub const SAVE_DELAY_SECS: u64 = 20;

/// Default enqueue delay for bulk actions.
pub const BULK_DELAY_SECS: u64 = 5;

/// One pending build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entity_id: u64,
    /// Build even when the entity carries the lock flag.
    #[serde(default)]
    pub force: bool,
}

/// Deduplicating, lock-guarded build queue.
pub struct Scheduler {
    path: PathBuf,
    queue: Mutex<Vec<QueueEntry>>,
    lease: Mutex<Option<Instant>>,
    drain_scheduled: AtomicBool,
    builder: Arc<PdfBuilder>,
    entities: Arc<dyn EntityStore>,
    // Self-handle for the drain tasks this scheduler spawns
    weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Open the scheduler, restoring any queue persisted by a prior run.
    pub fn open(
        data_dir: &std::path::Path,
        builder: Arc<PdfBuilder>,
        entities: Arc<dyn EntityStore>,
    ) -> Result<Arc<Self>, LibritoError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(QUEUE_FILE);

        let queue = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                LibritoError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Vec::new()
        };

        Ok(Arc::new_cyclic(|weak| Scheduler {
            path,
            queue: Mutex::new(queue),
            lease: Mutex::new(None),
            drain_scheduled: AtomicBool::new(false),
            builder,
            entities,
            weak: weak.clone(),
        }))
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.queue_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pending entries, in queue order.
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.queue_guard().clone()
    }

    /// Append a build request and schedule a drain after `delay`.
    ///
    /// The queue is deduplicated by entity id: an id already queued keeps
    /// its position and takes this call's force flag. Rapid enqueues
    /// within the delay window collapse into one scheduled drain.
    pub fn enqueue(
        &self,
        entity_id: u64,
        delay: Duration,
        force: bool,
    ) -> Result<(), LibritoError> {
        {
            let mut queue = self.queue_guard();
            queue.push(QueueEntry { entity_id, force });
            dedupe(&mut queue);
            self.persist(&queue)?;
        }
        self.schedule_drain(delay);
        Ok(())
    }

    /// Drain one batch off the queue.
    ///
    /// No-ops (returning 0) when another drain holds the lease. Pops up to
    /// [`BATCH_SIZE`] entries, persists the remainder immediately, builds
    /// each popped entity, and schedules a follow-up drain when entries
    /// remain. Returns the number of successful builds.
    pub async fn drain(&self) -> Result<usize, LibritoError> {
        let Some(_lease) = DrainLease::acquire(&self.lease) else {
            tracing::debug!("drain already running, skipping");
            return Ok(0);
        };

        let batch = {
            let mut queue = self.queue_guard();
            if queue.is_empty() {
                return Ok(0);
            }
            let take = queue.len().min(BATCH_SIZE);
            let batch: Vec<QueueEntry> = queue.drain(..take).collect();
            self.persist(&queue)?;
            batch
        };

        tracing::info!(count = batch.len(), "draining manual build queue");

        let mut processed = 0;
        for entry in batch {
            let locked = match self.entities.get(entry.entity_id) {
                Ok(Some(entity)) => entity.is_locked(),
                _ => false,
            };
            if locked && !entry.force {
                tracing::debug!(entity_id = entry.entity_id, "entity locked, skipping");
                continue;
            }

            match self
                .builder
                .build(entry.entity_id, None, &BTreeMap::new(), true)
                .await
            {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::warn!(entity_id = entry.entity_id, error = %e, "queued build failed");
                }
            }
        }

        let leftover = self.len();
        if leftover > 0 {
            tracing::info!(leftover, "queue not empty, rescheduling drain");
            self.schedule_drain(Duration::from_secs(RESCHEDULE_DELAY_SECS));
        }

        Ok(processed)
    }

    /// Periodic driver: drains on a fixed interval.
    ///
    /// Spawned by the server so persisted queues from other processes (or
    /// crashed runs) get picked up even without a scheduled one-shot.
    pub async fn run_periodic(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(RESCHEDULE_DELAY_SECS));
        loop {
            interval.tick().await;
            if self.is_empty() {
                continue;
            }
            if let Err(e) = self.drain().await {
                tracing::warn!(error = %e, "periodic drain failed");
            }
        }
    }

    /// Spawn a one-shot drain after `delay`, unless one is already pending.
    fn schedule_drain(&self, delay: Duration) {
        if self.drain_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(scheduler) = self.weak.upgrade() else {
            self.drain_scheduled.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Cleared before draining so enqueues during the drain can
            // schedule the next one
            scheduler.drain_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = scheduler.drain().await {
                tracing::warn!(error = %e, "scheduled drain failed");
            }
        });
    }

    fn persist(&self, queue: &[QueueEntry]) -> Result<(), LibritoError> {
        let contents = serde_json::to_string_pretty(queue)
            .map_err(|e| LibritoError::Storage(format!("Failed to serialize queue: {}", e)))?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    fn queue_guard(&self) -> MutexGuard<'_, Vec<QueueEntry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keep one entry per entity id: first position, latest force flag.
fn dedupe(queue: &mut Vec<QueueEntry>) {
    let mut latest_force: BTreeMap<u64, bool> = BTreeMap::new();
    for entry in queue.iter() {
        latest_force.insert(entry.entity_id, entry.force);
    }

    let mut seen = std::collections::BTreeSet::new();
    queue.retain(|entry| seen.insert(entry.entity_id));
    for entry in queue.iter_mut() {
        if let Some(&force) = latest_force.get(&entry.entity_id) {
            entry.force = force;
        }
    }
}

/// Scoped drain lease with a TTL.
///
/// Acquire fails while another holder is live. Dropping the guard releases
/// the lease on every exit path; a holder that never drops (crash) expires
/// after [`LEASE_TTL_SECS`].
struct DrainLease<'a> {
    slot: &'a Mutex<Option<Instant>>,
}

impl<'a> DrainLease<'a> {
    fn acquire(slot: &'a Mutex<Option<Instant>>) -> Option<Self> {
        let mut held = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(acquired_at) = *held
            && acquired_at.elapsed() < Duration::from_secs(LEASE_TTL_SECS)
        {
            return None;
        }
        *held = Some(Instant::now());
        Some(DrainLease { slot })
    }
}

impl Drop for DrainLease<'_> {
    fn drop(&mut self) {
        let mut held = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *held = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::entity::Entity;
    use crate::pdf::{PdfEngine, RenderOptions};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct StaticEngine;

    #[async_trait]
    impl PdfEngine for StaticEngine {
        async fn render(&self, _html: &str, _options: &RenderOptions) -> Result<Vec<u8>, LibritoError> {
            Ok(b"%PDF-1.4 static".to_vec())
        }
    }

    fn test_app(dir: &std::path::Path) -> Arc<App> {
        let settings = Settings {
            qr_endpoint: "http://127.0.0.1:9/".to_string(),
            ..Settings::default()
        };
        settings.save(dir).unwrap();
        Arc::new(App::open_with_engine(dir, Arc::new(StaticEngine)).unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_keeping_first_position() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let scheduler = &app.scheduler;

        scheduler.enqueue(1, Duration::from_secs(600), false).unwrap();
        scheduler.enqueue(2, Duration::from_secs(600), false).unwrap();
        scheduler.enqueue(1, Duration::from_secs(600), true).unwrap();

        let pending = scheduler.pending();
        assert_eq!(pending.len(), 2);
        // Id 1 keeps its first position but takes the later force flag
        assert_eq!(
            pending[0],
            QueueEntry {
                entity_id: 1,
                force: true
            }
        );
        assert_eq!(pending[1].entity_id, 2);
    }

    #[tokio::test]
    async fn test_queue_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let app = test_app(dir.path());
            app.scheduler
                .enqueue(7, Duration::from_secs(600), true)
                .unwrap();
        }
        let reopened = test_app(dir.path());
        assert_eq!(
            reopened.scheduler.pending(),
            vec![QueueEntry {
                entity_id: 7,
                force: true
            }]
        );
    }

    #[tokio::test]
    async fn test_drain_under_held_lease_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.entities.put(&Entity::new(1, "HW-001")).unwrap();
        app.scheduler
            .enqueue(1, Duration::from_secs(600), false)
            .unwrap();

        let _held = DrainLease::acquire(&app.scheduler.lease).unwrap();
        let processed = app.scheduler.drain().await.unwrap();
        assert_eq!(processed, 0);
        // Queue untouched
        assert_eq!(app.scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_expires_after_ttl() {
        let slot = Mutex::new(Some(
            Instant::now() - Duration::from_secs(LEASE_TTL_SECS + 1),
        ));
        // Stale lease is reclaimed
        assert!(DrainLease::acquire(&slot).is_some());
    }

    #[tokio::test]
    async fn test_lease_released_on_drop() {
        let slot = Mutex::new(None);
        {
            let _lease = DrainLease::acquire(&slot).unwrap();
            assert!(DrainLease::acquire(&slot).is_none());
        }
        assert!(DrainLease::acquire(&slot).is_some());
    }

    #[tokio::test]
    async fn test_drain_builds_and_skips_locked() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let mut open_entity = Entity::new(1, "open");
        open_entity
            .fields
            .insert("serial_code".to_string(), "HW-OPEN".to_string());
        app.entities.put(&open_entity).unwrap();

        let mut locked_entity = Entity::new(2, "locked");
        locked_entity
            .fields
            .insert("serial_code".to_string(), "HW-LOCK".to_string());
        locked_entity
            .meta
            .insert(crate::entity::META_LOCK.to_string(), "1".to_string());
        app.entities.put(&locked_entity).unwrap();

        app.scheduler
            .enqueue(1, Duration::from_secs(600), false)
            .unwrap();
        app.scheduler
            .enqueue(2, Duration::from_secs(600), false)
            .unwrap();

        let processed = app.scheduler.drain().await.unwrap();
        assert_eq!(processed, 1);

        let open_after = app.entities.get(1).unwrap().unwrap();
        assert!(!open_after.meta("manual_pdf_hash").is_empty());
        let locked_after = app.entities.get(2).unwrap().unwrap();
        assert!(locked_after.meta("manual_pdf_hash").is_empty());
    }

    #[tokio::test]
    async fn test_drain_forces_through_lock() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let mut entity = Entity::new(3, "HW-003");
        entity
            .meta
            .insert(crate::entity::META_LOCK.to_string(), "1".to_string());
        app.entities.put(&entity).unwrap();

        app.scheduler
            .enqueue(3, Duration::from_secs(600), true)
            .unwrap();
        let processed = app.scheduler.drain().await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn test_drain_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.entities.put(&Entity::new(1, "HW-001")).unwrap();

        // Id 999 does not exist and fails; id 1 still builds
        app.scheduler
            .enqueue(999, Duration::from_secs(600), false)
            .unwrap();
        app.scheduler
            .enqueue(1, Duration::from_secs(600), false)
            .unwrap();

        let processed = app.scheduler.drain().await.unwrap();
        assert_eq!(processed, 1);
        assert!(app.scheduler.is_empty());
    }

    #[test]
    fn test_dedupe_standalone() {
        let mut queue = vec![
            QueueEntry {
                entity_id: 5,
                force: false,
            },
            QueueEntry {
                entity_id: 6,
                force: true,
            },
            QueueEntry {
                entity_id: 5,
                force: true,
            },
            QueueEntry {
                entity_id: 6,
                force: false,
            },
        ];
        dedupe(&mut queue);
        assert_eq!(
            queue,
            vec![
                QueueEntry {
                    entity_id: 5,
                    force: true
                },
                QueueEntry {
                    entity_id: 6,
                    force: false
                },
            ]
        );
    }
}
