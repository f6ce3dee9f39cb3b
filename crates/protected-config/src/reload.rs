//! Reload tokens and the re-arming watcher built on them
//!
//! A [`ReloadToken`] is a one-shot notification: it fires at most once and
//! every callback registered before the fire runs exactly once, synchronously,
//! on the firing thread. Producers keep the current token in a
//! [`ReloadTokenSource`] and replace it on every reload with a single atomic
//! exchange, so readers always observe either the old or the new token.
//!
//! Because tokens are single-fire, anything that wants to follow *every*
//! reload has to register again after each fire. [`ChangeWatcher`] owns that
//! loop:
//!
//! ```text
//!   Armed ──upstream fires──▶ Fired ──refresh, re-register──▶ Armed (rearmed)
//!                                                   │
//!                                                   └──▶ publish
//! ```

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::{ConfigError, Result};

type Callback = Box<dyn FnOnce() -> Result<()> + Send>;
type Producer = Box<dyn Fn() -> Arc<ReloadToken> + Send + Sync>;
type Handler = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// One-shot change notification
pub struct ReloadToken {
    fired: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl ReloadToken {
    /// Create a token that has not fired yet
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Whether this token has already fired
    pub fn has_changed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Register a one-shot callback.
    ///
    /// Returns `None` without storing the callback when the token has already
    /// fired; callers that need the next change must ask the producer for its
    /// current token instead. Dropping the returned registration unregisters
    /// the callback.
    #[must_use]
    pub fn register<F>(self: &Arc<Self>, callback: F) -> Option<ChangeRegistration>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut callbacks = self.callbacks.lock();
        if self.has_changed() {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        callbacks.push((id, Box::new(callback)));

        Some(ChangeRegistration {
            token: Arc::downgrade(self),
            id,
        })
    }

    /// Number of callbacks waiting for this token
    pub fn registered(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Fire the token. Only the first call runs callbacks.
    ///
    /// Every callback runs even if an earlier one fails; the first error is
    /// returned to the caller.
    fn notify(&self) -> Result<()> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        let mut first_error: Option<ConfigError> = None;

        for (_, callback) in callbacks {
            if let Err(e) = callback() {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "Additional reload callback failed");
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn unregister(&self, id: u64) {
        self.callbacks.lock().retain(|(entry, _)| *entry != id);
    }
}

impl Default for ReloadToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReloadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadToken")
            .field("has_changed", &self.has_changed())
            .field("registered", &self.registered())
            .finish()
    }
}

/// Callback registration on a [`ReloadToken`]
///
/// Dropping it removes the callback if the token has not fired yet.
#[must_use = "dropping the registration unregisters the callback"]
pub struct ChangeRegistration {
    token: Weak<ReloadToken>,
    id: u64,
}

impl Drop for ChangeRegistration {
    fn drop(&mut self) {
        if let Some(token) = self.token.upgrade() {
            token.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for ChangeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRegistration")
            .field("id", &self.id)
            .finish()
    }
}

/// Holder of the current reload token of a producer
pub struct ReloadTokenSource {
    current: ArcSwap<ReloadToken>,
}

impl ReloadTokenSource {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ReloadToken::new()),
        }
    }

    /// The token observers should register on right now
    pub fn current(&self) -> Arc<ReloadToken> {
        self.current.load_full()
    }

    /// Swap in a fresh token and fire the previous one.
    ///
    /// The exchange is a single atomic swap, so concurrent callers each fire a
    /// distinct token and no token is fired twice.
    pub fn fire(&self) -> Result<()> {
        let previous = self.current.swap(Arc::new(ReloadToken::new()));
        previous.notify()
    }
}

impl Default for ReloadTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReloadTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadTokenSource")
            .field("current", &self.current.load_full())
            .finish()
    }
}

enum WatchState {
    /// Callback registered on the upstream token of this generation
    Armed {
        token: Arc<ReloadToken>,
        _registration: ChangeRegistration,
        generation: u64,
    },
    /// Upstream token fired, refresh running
    Fired { generation: u64 },
    Stopped { generation: u64 },
}

impl WatchState {
    fn generation(&self) -> u64 {
        match self {
            Self::Armed { generation, .. } | Self::Fired { generation } | Self::Stopped { generation } => {
                *generation
            }
        }
    }
}

struct WatcherInner {
    name: String,
    producer: Producer,
    refresh: Handler,
    publish: Handler,
    state: Mutex<WatchState>,
}

/// Follows every reload of an upstream producer.
///
/// On each upstream fire the watcher runs `refresh`, registers again on the
/// producer's current token, then runs `publish`. `publish` is skipped when
/// `refresh` fails; the watcher stays armed either way and the error goes to
/// whoever fired the upstream token.
pub struct ChangeWatcher {
    inner: Arc<WatcherInner>,
}

impl ChangeWatcher {
    pub fn new<P, R, U>(name: impl Into<String>, producer: P, refresh: R, publish: U) -> Result<Self>
    where
        P: Fn() -> Arc<ReloadToken> + Send + Sync + 'static,
        R: Fn() -> Result<()> + Send + Sync + 'static,
        U: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let inner = Arc::new(WatcherInner {
            name: name.into(),
            producer: Box::new(producer),
            refresh: Box::new(refresh),
            publish: Box::new(publish),
            state: Mutex::new(WatchState::Fired { generation: 0 }),
        });

        WatcherInner::arm(&inner, 0, None)?;
        Ok(Self { inner })
    }

    /// Watcher that only forwards upstream changes
    pub fn on_change<P, U>(name: impl Into<String>, producer: P, publish: U) -> Result<Self>
    where
        P: Fn() -> Arc<ReloadToken> + Send + Sync + 'static,
        U: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, producer, || Ok(()), publish)
    }

    /// Whether an upstream fire is about to be, or is being, handled
    pub fn is_pending(&self) -> bool {
        match &*self.inner.state.lock() {
            WatchState::Armed { token, .. } => token.has_changed(),
            WatchState::Fired { .. } => true,
            WatchState::Stopped { .. } => false,
        }
    }

    /// Number of upstream fires handled so far
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let generation = state.generation();
        *state = WatchState::Stopped { generation };
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("name", &self.inner.name)
            .field("generation", &self.generation())
            .finish()
    }
}

impl WatcherInner {
    /// Register on `first`, or on the producer's current token, and keep
    /// refreshing until a registration sticks.
    fn arm(inner: &Arc<Self>, mut generation: u64, mut first: Option<Arc<ReloadToken>>) -> Result<()> {
        let mut deferred: Option<ConfigError> = None;
        let mut previous: Option<Arc<ReloadToken>> = None;

        loop {
            let token = first.take().unwrap_or_else(|| (inner.producer)());

            if previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &token)) {
                warn!(
                    watcher = %inner.name,
                    "Producer keeps returning a fired token; stop watching"
                );
                *inner.state.lock() = WatchState::Stopped { generation };
                break;
            }

            let mut state = inner.state.lock();
            if matches!(*state, WatchState::Stopped { .. }) {
                break;
            }

            let weak = Arc::downgrade(inner);
            let registration = token.register(move || match weak.upgrade() {
                Some(inner) => WatcherInner::on_fire(&inner, generation),
                None => Ok(()),
            });

            match registration {
                Some(registration) => {
                    *state = WatchState::Armed {
                        token,
                        _registration: registration,
                        generation,
                    };
                    break;
                }
                None => {
                    drop(state);
                    debug!(
                        watcher = %inner.name,
                        generation,
                        "Upstream token fired before registration, refreshing again"
                    );
                    if let Err(e) = (inner.refresh)() {
                        deferred.get_or_insert(e);
                    }
                    generation += 1;
                    previous = Some(token);
                }
            }
        }

        deferred.map_or(Ok(()), Err)
    }

    fn on_fire(inner: &Arc<Self>, generation: u64) -> Result<()> {
        {
            let mut state = inner.state.lock();
            match &*state {
                WatchState::Armed {
                    generation: armed, ..
                } if *armed == generation => {}
                _ => return Ok(()),
            }
            *state = WatchState::Fired { generation };
        }

        debug!(watcher = %inner.name, generation, "Upstream reload fired");

        // Taken before refreshing so a reload landing mid-refresh is seen as
        // an already fired token and refreshed again
        let next = (inner.producer)();
        let refreshed = (inner.refresh)();
        let rearmed = Self::arm(inner, generation + 1, Some(next));
        refreshed?;
        rearmed?;
        (inner.publish)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Result<()> + Send + Sync + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_callback_runs_once() {
        let source = ReloadTokenSource::new();
        let token = source.current();
        let (count, callback) = counter();

        let _registration = token.register(callback).unwrap();
        source.fire().unwrap();
        source.fire().unwrap();

        assert!(token.has_changed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_swaps_token() {
        let source = ReloadTokenSource::new();
        let before = source.current();
        source.fire().unwrap();
        let after = source.current();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.has_changed());
        assert!(!after.has_changed());
    }

    #[test]
    fn test_register_on_fired_token() {
        let source = ReloadTokenSource::new();
        let token = source.current();
        source.fire().unwrap();

        let (count, callback) = counter();
        assert!(token.register(callback).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_registration_is_not_invoked() {
        let source = ReloadTokenSource::new();
        let (count, callback) = counter();

        let registration = source.current().register(callback).unwrap();
        assert_eq!(source.current().registered(), 1);
        drop(registration);
        assert_eq!(source.current().registered(), 0);

        source.fire().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_error_is_returned_after_all_callbacks_ran() {
        let source = ReloadTokenSource::new();
        let token = source.current();
        let (count, callback) = counter();

        let _failing = token
            .register(|| Err(ConfigError::decryption("bad payload")))
            .unwrap();
        let _counting = token.register(callback).unwrap();

        let result = source.fire();
        assert!(matches!(result, Err(ConfigError::Decryption(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_fire_notifies_each_token_once() {
        let source = Arc::new(ReloadTokenSource::new());
        let (count, callback) = counter();
        let _registration = source.current().register(callback).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || source.fire().unwrap())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watcher_follows_every_reload() {
        let upstream = Arc::new(ReloadTokenSource::new());
        let (refreshes, refresh) = counter();
        let (publishes, publish) = counter();

        let producer = Arc::clone(&upstream);
        let watcher =
            ChangeWatcher::new("test", move || producer.current(), refresh, publish).unwrap();

        for _ in 0..3 {
            upstream.fire().unwrap();
        }

        assert_eq!(refreshes.load(Ordering::SeqCst), 3);
        assert_eq!(publishes.load(Ordering::SeqCst), 3);
        assert_eq!(watcher.generation(), 3);
        assert!(!watcher.is_pending());
    }

    #[test]
    fn test_watcher_skips_publish_when_refresh_fails() {
        let upstream = Arc::new(ReloadTokenSource::new());
        let (publishes, publish) = counter();

        let producer = Arc::clone(&upstream);
        let _watcher = ChangeWatcher::new(
            "failing",
            move || producer.current(),
            || Err(ConfigError::decryption("corrupt")),
            publish,
        )
        .unwrap();

        assert!(upstream.fire().is_err());
        assert_eq!(publishes.load(Ordering::SeqCst), 0);
        // still armed on the next token
        assert_eq!(upstream.current().registered(), 1);
    }

    #[test]
    fn test_dropped_watcher_stops_listening() {
        let upstream = Arc::new(ReloadTokenSource::new());
        let (publishes, publish) = counter();

        let producer = Arc::clone(&upstream);
        let watcher = ChangeWatcher::on_change("dropped", move || producer.current(), publish).unwrap();
        drop(watcher);

        upstream.fire().unwrap();
        assert_eq!(publishes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stuck_producer_stops_and_keeps_generation() {
        let stuck = Arc::new(ReloadToken::new());
        stuck.notify().unwrap();
        let (refreshes, refresh) = counter();

        let producer = Arc::clone(&stuck);
        let watcher =
            ChangeWatcher::new("stuck", move || Arc::clone(&producer), refresh, || Ok(())).unwrap();

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.generation(), 1);
        assert!(!watcher.is_pending());
    }
}
