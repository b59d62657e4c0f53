use ahash::AHashMap as HashMap;
use parapet_controller_core::Resource;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// A concurrency-safe container for one category of synthesized resources.
///
/// The dynamic mapping is an owned, immutable generation behind an `Arc`;
/// [`SnapshotCache::replace`] swaps the whole generation, so readers always
/// observe one complete mapping and never a mix of two. Static resources are
/// fixed at construction and always present; dynamic values shadow them on
/// name collision.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    type_url: &'static str,
    dynamic: RwLock<Arc<HashMap<String, T>>>,
    statics: HashMap<String, T>,
    version: watch::Sender<u64>,
}

/// The cache surface exposed to config-protocol stream handlers.
pub trait ResourceCache<T>: Send + Sync {
    /// The resource category this cache serves; routes incoming
    /// subscription requests to the right cache instance.
    fn type_url(&self) -> &'static str;

    /// All resources, sorted by name.
    fn contents(&self) -> Vec<T>;

    /// The named resources that exist, sorted by name.
    fn query(&self, names: &[String]) -> Vec<T>;

    /// Subscribes to replace notifications.
    fn changes(&self) -> ChangeListener;
}

/// Wakes when the cache contents are replaced.
///
/// Level-triggered: a burst of replaces coalesces into a single wake-up and
/// no signal count is buffered, so observers re-read the cache after every
/// wake-up instead of counting signals.
#[derive(Clone, Debug)]
pub struct ChangeListener(watch::Receiver<u64>);

// === impl SnapshotCache ===

impl<T: Resource + Clone> SnapshotCache<T> {
    pub fn new(type_url: &'static str, statics: impl IntoIterator<Item = T>) -> Self {
        let statics = statics
            .into_iter()
            .map(|resource| (resource.name().to_string(), resource))
            .collect();
        let (version, _) = watch::channel(0);
        Self {
            type_url,
            dynamic: RwLock::new(Arc::new(HashMap::new())),
            statics,
            version,
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    /// Replaces the dynamic contents wholesale and wakes all change
    /// listeners.
    ///
    /// The previous generation becomes unreachable as soon as the last
    /// reader holding it finishes; nothing is mutated in place.
    pub fn replace(&self, next: HashMap<String, T>) {
        let mut dynamic = self.dynamic.write();
        *dynamic = Arc::new(next);
        // Listeners are woken while the guard is held: a woken reader's next
        // read cannot observe a generation older than the one that woke it.
        self.version.send_modify(|version| *version += 1);
    }

    /// Returns a copy of every resource, dynamic and static, sorted by name.
    ///
    /// Later cache mutation does not alter a previously returned vector.
    pub fn contents(&self) -> Vec<T> {
        let dynamic = self.dynamic.read().clone();
        let mut values: Vec<T> = dynamic.values().cloned().collect();
        values.extend(
            self.statics
                .iter()
                .filter(|(name, _)| !dynamic.contains_key(name.as_str()))
                .map(|(_, resource)| resource.clone()),
        );
        values.sort_by(|a, b| a.name().cmp(b.name()));
        values
    }

    /// Looks up each requested name, dynamic first, then static.
    ///
    /// Names matching neither are silently omitted: the protocol cannot
    /// express a listener without a bind address, so omission is the only
    /// valid "does not exist" signal. Output is sorted by resource name;
    /// input order is not preserved.
    pub fn query(&self, names: &[String]) -> Vec<T> {
        let dynamic = self.dynamic.read().clone();
        let mut values: Vec<T> = names
            .iter()
            .filter_map(|name| dynamic.get(name).or_else(|| self.statics.get(name)))
            .cloned()
            .collect();
        values.sort_by(|a, b| a.name().cmp(b.name()));
        values
    }

    pub fn changes(&self) -> ChangeListener {
        ChangeListener(self.version.subscribe())
    }
}

impl<T: Resource + Clone + Send + Sync> ResourceCache<T> for SnapshotCache<T> {
    fn type_url(&self) -> &'static str {
        SnapshotCache::type_url(self)
    }

    fn contents(&self) -> Vec<T> {
        SnapshotCache::contents(self)
    }

    fn query(&self, names: &[String]) -> Vec<T> {
        SnapshotCache::query(self, names)
    }

    fn changes(&self) -> ChangeListener {
        SnapshotCache::changes(self)
    }
}

// === impl ChangeListener ===

impl ChangeListener {
    /// Waits for the next replace after the one this listener last observed.
    ///
    /// Cancel-safe: dropping the future abandons the wait without consuming
    /// a wake-up. Returns `false` once the cache has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}
