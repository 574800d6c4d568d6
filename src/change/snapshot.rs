use super::*;

#[derive(Default)]
struct StoreInner {
    by_id: HashMap<Uuid, Arc<ConfigSnapshot>>,
    /// Newest first.
    by_device: HashMap<DeviceId, VecDeque<Uuid>>,
}

/// In-memory snapshot history keeping the newest `retention` snapshots of
/// each device. Stored snapshots are shared read-only.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Mutex<StoreInner>>,
    retention: usize,
}

impl SnapshotStore {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut inner = self.lock();
        let StoreInner { by_id, by_device } = &mut *inner;
        let history = by_device.entry(snapshot.device.clone()).or_default();
        history.push_front(snapshot.id);
        while history.len() > self.retention {
            if let Some(evicted) = history.pop_back() {
                by_id.remove(&evicted);
                debug!("{}: evicted snapshot {}", snapshot.device, evicted);
            }
        }
        by_id.insert(snapshot.id, Arc::clone(&snapshot));
        snapshot
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<ConfigSnapshot>> {
        self.lock().by_id.get(id).cloned()
    }

    /// Snapshots of `device`, newest first, optionally of one type.
    pub fn list(&self, device: &DeviceId, kind: Option<SnapshotType>) -> Vec<Arc<ConfigSnapshot>> {
        let inner = self.lock();
        let Some(history) = inner.by_device.get(device) else {
            return Vec::new();
        };
        history
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|s| kind.is_none_or(|k| s.snapshot_type == k))
            .cloned()
            .collect()
    }

    pub fn latest(&self, device: &DeviceId, kind: Option<SnapshotType>) -> Option<Arc<ConfigSnapshot>> {
        self.list(device, kind).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(device: &str, kind: SnapshotType, config: &str) -> ConfigSnapshot {
        ConfigSnapshot::new(DeviceId::new(device), "cisco", kind, config)
    }

    #[test]
    fn keeps_newest_snapshots_per_device() {
        let store = SnapshotStore::new(2);
        let first = store.insert(snap("sw1", SnapshotType::Backup, "a"));
        let second = store.insert(snap("sw1", SnapshotType::PreChange, "b"));
        let third = store.insert(snap("sw1", SnapshotType::PostChange, "c"));
        store.insert(snap("sw2", SnapshotType::Backup, "z"));

        assert!(store.get(&first.id).is_none());
        let ids: Vec<Uuid> = store
            .list(&DeviceId::new("sw1"), None)
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn filters_by_type() {
        let store = SnapshotStore::new(10);
        store.insert(snap("r1", SnapshotType::Backup, "one"));
        let pre = store.insert(snap("r1", SnapshotType::PreChange, "two"));
        store.insert(snap("r1", SnapshotType::Backup, "three"));

        let latest = store
            .latest(&DeviceId::new("r1"), Some(SnapshotType::PreChange))
            .expect("pre-change snapshot");
        assert_eq!(latest.id, pre.id);
        assert_eq!(store.list(&DeviceId::new("r1"), Some(SnapshotType::Backup)).len(), 2);
        assert!(store.list(&DeviceId::new("r2"), None).is_empty());
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let s = snap("r1", SnapshotType::Backup, "hostname r1\n");
        assert_eq!(s.checksum.len(), 64);
        assert_eq!(s.checksum, checksum("hostname r1\n"));
        assert_ne!(s.checksum, checksum("hostname r2\n"));
        assert_eq!(s.line_count, 1);
        assert_eq!(s.size, 12);
    }
}
