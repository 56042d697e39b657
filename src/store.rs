use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::ports::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then writes
/// and fsyncs the batch as one unit.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = wal.append_batch(batch.iter().map(|append| &append.event));
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), size = batch.len(), "WAL batch rejected: {e}");
        }

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

// ── Per-resource index ───────────────────────────────────

/// Open booking spans on one resource, sorted by `span.start`.
#[derive(Debug, Default)]
struct ResourceIndex {
    open: Vec<(Span, Ulid)>,
}

impl ResourceIndex {
    fn insert(&mut self, span: Span, id: Ulid) {
        let pos = self
            .open
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.open.insert(pos, (span, id));
    }

    fn remove(&mut self, id: Ulid) {
        self.open.retain(|(_, b)| *b != id);
    }

    /// Entries overlapping `query`. Everything at or after the partition
    /// point starts at or after `query.end` and can't overlap.
    fn overlapping(&self, query: &Span) -> impl Iterator<Item = &(Span, Ulid)> {
        let right_bound = self.open.partition_point(|(s, _)| s.start < query.end);
        self.open[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
    }
}

/// DashMap-backed implementation of every persistence port, optionally made
/// durable by a write-ahead log.
pub struct MemoryStore {
    users: DashMap<Ulid, User>,
    resources: DashMap<Ulid, Resource>,
    rules: DashMap<Ulid, AvailabilityRule>,
    bookings: DashMap<Ulid, Booking>,
    by_resource: DashMap<Ulid, ResourceIndex>,
    by_user: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes booking check-and-write so the overlap backstop is exact.
    booking_write: Mutex<()>,
    wal_tx: Option<mpsc::Sender<WalAppend>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store; nothing survives a restart.
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            resources: DashMap::new(),
            rules: DashMap::new(),
            bookings: DashMap::new(),
            by_resource: DashMap::new(),
            by_user: DashMap::new(),
            booking_write: Mutex::new(()),
            wal_tx: None,
        }
    }

    /// Durable store: replays `wal_path` then appends every write to it.
    /// A torn tail is cut off first. Must be called inside a tokio runtime
    /// (spawns the WAL writer).
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(wal_path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));

        let mut store = Self::new();
        for event in &events {
            store.apply(event);
        }
        store.wal_tx = Some(tx);
        tracing::info!(path = %wal_path.display(), records = events.len(), "store replayed");
        Ok(store)
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        self.persist(Event::UserUpserted(user)).await
    }

    pub async fn upsert_resource(&self, resource: Resource) -> Result<(), StoreError> {
        self.persist(Event::ResourceUpserted(resource)).await
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append then apply.
    async fn persist(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::UserUpserted(user) => {
                self.users.insert(user.id, user.clone());
            }
            Event::ResourceUpserted(resource) => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::RuleSaved(rule) => {
                self.rules.insert(rule.id, rule.clone());
            }
            Event::RuleDeleted { id, .. } => {
                self.rules.remove(id);
            }
            Event::BookingSaved(booking) => {
                if let Some(previous) = self.bookings.insert(booking.id, booking.clone())
                    && let Some(mut index) = self.by_resource.get_mut(&previous.resource_id)
                {
                    index.remove(previous.id);
                }
                if booking.is_open() {
                    self.by_resource
                        .entry(booking.resource_id)
                        .or_default()
                        .insert(booking.span, booking.id);
                }
                let mut ids = self.by_user.entry(booking.user_id).or_default();
                if !ids.contains(&booking.id) {
                    ids.push(booking.id);
                }
            }
        }
    }

    fn first_overlap(&self, booking: &Booking) -> Option<Ulid> {
        let index = self.by_resource.get(&booking.resource_id)?;
        let other = index
            .overlapping(&booking.span)
            .find(|(_, id)| *id != booking.id)
            .map(|(_, id)| *id);
        other
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let _write = self.booking_write.lock().await;
        if booking.is_open()
            && let Some(other) = self.first_overlap(booking)
        {
            return Err(StoreError::Conflict(other));
        }
        self.persist(Event::BookingSaved(booking.clone())).await
    }

    async fn update_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let _write = self.booking_write.lock().await;
        if !self.bookings.contains_key(&booking.id) {
            return Err(StoreError::NotFound(booking.id));
        }
        if booking.is_open()
            && let Some(other) = self.first_overlap(booking)
        {
            return Err(StoreError::Conflict(other));
        }
        self.persist(Event::BookingSaved(booking.clone())).await
    }

    async fn open_bookings_overlapping(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(index) = self.by_resource.get(&resource_id) else {
            return Ok(Vec::new());
        };
        let ids: Vec<Ulid> = index
            .overlapping(&span)
            .map(|(_, id)| *id)
            .filter(|id| Some(*id) != exclude)
            .collect();
        drop(index);
        Ok(ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect())
    }

    async fn open_bookings_for_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .by_user
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut open: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .filter(Booking::is_open)
            .collect();
        open.sort_by_key(Booking::start);
        Ok(open)
    }

    async fn bookings_starting_in(
        &self,
        window: Span,
        status: BookingStatus,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut found: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.status == status && window.contains_instant(b.start()))
            .map(|b| b.value().clone())
            .collect();
        found.sort_by_key(Booking::start);
        Ok(found)
    }
}

#[async_trait]
impl AvailabilityStore for MemoryStore {
    async fn get_rule(&self, id: Ulid) -> Result<Option<AvailabilityRule>, StoreError> {
        Ok(self.rules.get(&id).map(|r| r.value().clone()))
    }

    async fn insert_rule(&self, rule: &AvailabilityRule) -> Result<(), StoreError> {
        self.persist(Event::RuleSaved(rule.clone())).await
    }

    async fn update_rule(&self, rule: &AvailabilityRule) -> Result<(), StoreError> {
        if !self.rules.contains_key(&rule.id) {
            return Err(StoreError::NotFound(rule.id));
        }
        self.persist(Event::RuleSaved(rule.clone())).await
    }

    async fn delete_rule(&self, id: Ulid) -> Result<(), StoreError> {
        let resource_id = self
            .rules
            .get(&id)
            .map(|r| r.resource_id)
            .ok_or(StoreError::NotFound(id))?;
        self.persist(Event::RuleDeleted { id, resource_id }).await
    }

    async fn rules_for_resource(&self, resource_id: Ulid) -> Result<Vec<AvailabilityRule>, StoreError> {
        let mut rules: Vec<AvailabilityRule> = self
            .rules
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by_key(|r| (r.day_of_week, r.start_time));
        Ok(rules)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, id: Ulid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }
}

#[async_trait]
impl ResourceDirectory for MemoryStore {
    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.resources.get(&id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chairbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(resource_id: Ulid, start: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            resource_id,
            span: Span::slot(start),
            status: BookingStatus::Scheduled,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn insert_rejects_overlapping_open_booking() {
        let store = MemoryStore::new();
        let rid = Ulid::new();
        let first = booking(rid, 10 * HOUR_MS);
        store.insert_booking(&first).await.unwrap();

        let clash = booking(rid, 10 * HOUR_MS + 15 * MINUTE_MS);
        assert_eq!(
            store.insert_booking(&clash).await,
            Err(StoreError::Conflict(first.id))
        );

        // Adjacent is fine (half-open).
        let next = booking(rid, 10 * HOUR_MS + SLOT_MS);
        store.insert_booking(&next).await.unwrap();

        // Different resource is fine.
        store.insert_booking(&booking(Ulid::new(), 10 * HOUR_MS)).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_booking_frees_its_span() {
        let store = MemoryStore::new();
        let rid = Ulid::new();
        let mut first = booking(rid, 10 * HOUR_MS);
        store.insert_booking(&first).await.unwrap();

        first.status = BookingStatus::Cancelled;
        store.update_booking(&first).await.unwrap();

        let again = booking(rid, 10 * HOUR_MS);
        store.insert_booking(&again).await.unwrap();
        let open = store
            .open_bookings_overlapping(rid, Span::slot(10 * HOUR_MS), None)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, again.id);
    }

    #[tokio::test]
    async fn moving_a_booking_reindexes_it() {
        let store = MemoryStore::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut moving = booking(a, 9 * HOUR_MS);
        store.insert_booking(&moving).await.unwrap();

        moving.resource_id = b;
        moving.set_start(14 * HOUR_MS);
        store.update_booking(&moving).await.unwrap();

        assert!(store
            .open_bookings_overlapping(a, Span::slot(9 * HOUR_MS), None)
            .await
            .unwrap()
            .is_empty());
        let on_b = store
            .open_bookings_overlapping(b, Span::slot(14 * HOUR_MS), None)
            .await
            .unwrap();
        assert_eq!(on_b.len(), 1);
        // Excluding itself finds nothing.
        assert!(store
            .open_bookings_overlapping(b, Span::slot(14 * HOUR_MS), Some(moving.id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_unknown_booking_fails() {
        let store = MemoryStore::new();
        let b = booking(Ulid::new(), 0);
        assert_eq!(store.update_booking(&b).await, Err(StoreError::NotFound(b.id)));
    }

    #[tokio::test]
    async fn user_and_window_queries() {
        let store = MemoryStore::new();
        let rid = Ulid::new();
        let mut early = booking(rid, 8 * HOUR_MS);
        let mut late = booking(rid, 30 * HOUR_MS);
        late.user_id = early.user_id;
        early.status = BookingStatus::PresenceConfirmed;
        late.status = BookingStatus::PresenceConfirmed;
        store.insert_booking(&late).await.unwrap();
        store.insert_booking(&early).await.unwrap();

        let open = store.open_bookings_for_user(early.user_id).await.unwrap();
        assert_eq!(open.iter().map(|b| b.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        assert_eq!(store.count_open_bookings_for_user(early.user_id).await.unwrap(), 2);

        let day_one = store
            .bookings_starting_in(Span::new(0, DAY_MS), BookingStatus::PresenceConfirmed)
            .await
            .unwrap();
        assert_eq!(day_one.len(), 1);
        assert_eq!(day_one[0].id, early.id);
        assert!(store
            .bookings_starting_in(Span::new(0, DAY_MS), BookingStatus::Scheduled)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rules_by_resource_and_day() {
        let store = MemoryStore::new();
        let rid = Ulid::new();
        for (day, start) in [(2u8, "13:00"), (1, "09:00"), (2, "08:00")] {
            store
                .insert_rule(&AvailabilityRule {
                    id: Ulid::new(),
                    resource_id: rid,
                    day_of_week: day,
                    start_time: WallTime::parse(start).unwrap(),
                    end_time: WallTime::parse("20:00").unwrap(),
                    valid_from: None,
                    valid_to: None,
                    active: true,
                })
                .await
                .unwrap();
        }
        let tuesday = store.rules_for_resource_day(rid, 2).await.unwrap();
        let starts: Vec<String> = tuesday.iter().map(|r| r.start_time.to_string()).collect();
        assert_eq!(starts, vec!["08:00", "13:00"]);

        store.delete_rule(tuesday[0].id).await.unwrap();
        assert_eq!(store.rules_for_resource(rid).await.unwrap().len(), 2);
        assert_eq!(
            store.delete_rule(tuesday[0].id).await,
            Err(StoreError::NotFound(tuesday[0].id))
        );
    }

    #[tokio::test]
    async fn wal_replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let rid = Ulid::new();
        let uid = Ulid::new();
        let mut b = booking(rid, 10 * HOUR_MS);
        b.user_id = uid;
        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .upsert_user(User { id: uid, approval: ApprovalStatus::Approved })
                .await
                .unwrap();
            store
                .upsert_resource(Resource { id: rid, name: None, status: ResourceStatus::Active })
                .await
                .unwrap();
            store.insert_booking(&b).await.unwrap();
            b.notes = Some("moved".into());
            store.update_booking(&b).await.unwrap();
        }

        let store = MemoryStore::open(&path).unwrap();
        assert!(store.get_user(uid).await.unwrap().unwrap().is_approved());
        assert!(store.get_resource(rid).await.unwrap().unwrap().is_active());
        assert_eq!(store.get_booking(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(store.booking_count(), 1);
        // Index rebuilt: the slot is still taken.
        let clash = booking(rid, 10 * HOUR_MS);
        assert_eq!(store.insert_booking(&clash).await, Err(StoreError::Conflict(b.id)));
    }

    #[tokio::test]
    async fn writes_after_a_torn_tail_survive_the_next_restart() {
        use std::io::Write;

        let path = test_wal_path("torn_restart.wal");
        let first = User { id: Ulid::new(), approval: ApprovalStatus::Approved };
        let second = User { id: Ulid::new(), approval: ApprovalStatus::Approved };
        {
            let store = MemoryStore::open(&path).unwrap();
            store.upsert_user(first.clone()).await.unwrap();
        }
        // Crash mid-frame.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[7, 0])
            .unwrap();
        {
            let store = MemoryStore::open(&path).unwrap();
            assert_eq!(store.get_user(first.id).await.unwrap(), Some(first.clone()));
            store.upsert_user(second.clone()).await.unwrap();
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_user(first.id).await.unwrap(), Some(first));
        assert_eq!(store.get_user(second.id).await.unwrap(), Some(second));
    }
}
