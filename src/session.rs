//! Lifecycle of a lock session.
//!
//! A [`SessionManager`] owns the lock-state cache and two background tasks:
//!
//! - the **refresh loop**, which keeps the access token valid on a fixed
//!   interval, and
//! - the **poll loop** (optional), which fetches the actuator list, swaps in a
//!   new snapshot of the cache and then notifies every registered callback in
//!   registration order.
//!
//! The cache is an `Arc<LockMap>` behind a lock held only for the swap, so
//! readers and callbacks always see a complete snapshot. [`SessionManager::close`]
//! cancels both tasks and waits for them to finish; once it returns nothing
//! touches the cache or fires a callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenAuthority;
use crate::client::OpendoorsClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{LockActionType, LockAttributes, LockMap};
use crate::transport::HttpTransport;

/// Subscriber invoked with the full lock map after every successful poll cycle
pub type LocksCallback = Arc<dyn Fn(&LockMap) + Send + Sync>;

/// Background task settings for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Run the poll loop after `connect()`
    pub poll: bool,
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll: true,
            poll_interval: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// State shared between the session handle and its background tasks
struct SessionState {
    client: OpendoorsClient,
    locks: RwLock<Arc<LockMap>>,
    callbacks: Mutex<Vec<LocksCallback>>,
    /// Serialises poll cycles so the cache has a single writer at a time
    cycle: tokio::sync::Mutex<()>,
}

impl SessionState {
    /// Fetch the actuator list, swap the cache, then notify subscribers.
    ///
    /// On failure the previous snapshot stays in place and no callback fires.
    async fn poll_cycle(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let locks = self.client.get_locks().await?;
        Ok(self.publish(locks))
    }

    fn publish(&self, locks: Vec<LockAttributes>) -> usize {
        let snapshot: Arc<LockMap> = Arc::new(
            locks
                .into_iter()
                .map(|lock| (lock.uid.clone(), lock))
                .collect(),
        );
        *self.locks.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);

        let callbacks = lock(&self.callbacks).clone();
        debug!(
            "Lock cache updated with {} actuators, notifying {} callbacks",
            snapshot.len(),
            callbacks.len()
        );
        for callback in &callbacks {
            callback(&snapshot);
        }
        snapshot.len()
    }

    fn snapshot(&self) -> Arc<LockMap> {
        Arc::clone(&self.locks.read().unwrap_or_else(PoisonError::into_inner))
    }
}

struct RunningTasks {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Single entry and exit point for a lock session.
pub struct SessionManager {
    state: Arc<SessionState>,
    options: SessionOptions,
    tasks: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl SessionManager {
    pub fn new(client: OpendoorsClient, options: SessionOptions) -> Self {
        Self {
            state: Arc::new(SessionState {
                client,
                locks: RwLock::new(Arc::new(LockMap::new())),
                callbacks: Mutex::new(Vec::new()),
                cycle: tokio::sync::Mutex::new(()),
            }),
            options,
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &Config) -> Self {
        Self::new(
            OpendoorsClient::from_config(transport, config),
            config.session_options(),
        )
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        self.state.client.authority()
    }

    /// Start the refresh loop and, if enabled, the poll loop.
    ///
    /// Calling `connect()` on a connected session does nothing. A closed
    /// session can be connected again.
    pub async fn connect(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            debug!("Session already connected");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("connect() requires a Tokio runtime: {}", e)))?;

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        handles.push((
            "refresh",
            runtime.spawn(refresh_loop(
                Arc::clone(self.authority()),
                self.options.refresh_interval,
                shutdown.clone(),
            )),
        ));

        if self.options.poll {
            handles.push((
                "poll",
                runtime.spawn(poll_loop(
                    Arc::clone(&self.state),
                    self.options.poll_interval,
                    shutdown.clone(),
                )),
            ));
        }

        info!(
            "Session connected (polling {})",
            if self.options.poll { "enabled" } else { "disabled" }
        );
        *tasks = Some(RunningTasks { shutdown, handles });
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Stop both background tasks and wait until they have terminated.
    ///
    /// Idempotent. Concurrent callers all return only after the tasks are gone.
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some(running) = tasks.take() else {
            debug!("Session already closed");
            return;
        };

        running.shutdown.cancel();
        for (name, handle) in running.handles {
            if let Err(e) = handle.await {
                warn!("Session {} task ended abnormally: {}", name, e);
            }
        }
        info!("Session closed");
    }

    /// Subscribe to cache updates.
    ///
    /// Callbacks run on the polling task, in registration order, once per
    /// successful cycle. The current snapshot is not replayed on registration;
    /// read [`SessionManager::locks`] for that.
    pub fn register_locks_callback<F>(&self, callback: F)
    where
        F: Fn(&LockMap) + Send + Sync + 'static,
    {
        lock(&self.state.callbacks).push(Arc::new(callback));
    }

    /// Snapshot of the lock cache
    pub fn locks(&self) -> Arc<LockMap> {
        self.state.snapshot()
    }

    pub fn lock(&self, uid: &str) -> Option<LockAttributes> {
        self.state.snapshot().get(uid).cloned()
    }

    /// Run one poll cycle in the foreground and return the number of actuators.
    ///
    /// Unlike the background loop, failures are returned to the caller.
    pub async fn refresh_locks(&self) -> Result<usize> {
        self.state.poll_cycle().await
    }

    /// Ask the actuator `uid` to perform `action`.
    ///
    /// The cache is left untouched; the next poll cycle reports the outcome.
    pub async fn lock_action(&self, uid: &str, action: LockActionType) -> Result<()> {
        if !self.state.snapshot().contains_key(uid) {
            return Err(Error::UnknownDevice(uid.to_string()));
        }
        self.state.client.send_lock_action(uid, action).await
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Without an async context the tasks can only be signalled, not joined
        if let Some(running) = self.tasks.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn refresh_loop(
    authority: Arc<TokenAuthority>,
    period: Duration,
    shutdown: CancellationToken,
) {
    debug!("Token refresh task started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = authority.ensure_token_valid() => {
                match result {
                    Ok(()) => {}
                    Err(e @ Error::Authentication { .. }) => error!("Token refresh rejected: {}", e),
                    Err(e) => warn!("Token refresh failed: {}", e),
                }
            }
        }
    }
    debug!("Token refresh task stopped");
}

async fn poll_loop(state: Arc<SessionState>, period: Duration, shutdown: CancellationToken) {
    debug!("Poll task started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // The swap and callbacks run without an await in between, so a
        // cancelled cycle either published completely or not at all.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = state.poll_cycle() => {
                if let Err(e) = result {
                    warn!("Poll cycle failed, keeping previous lock states: {}", e);
                }
            }
        }
    }
    debug!("Poll task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::testing::ScriptedTransport;
    use crate::transport::{HttpRequest, HttpResponse};
    use reqwest::Method;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with(transport: Arc<ScriptedTransport>, options: SessionOptions) -> SessionManager {
        let authority = Arc::new(TokenAuthority::new(
            transport.clone(),
            Credentials {
                token_endpoint_url: "https://auth.example.com/token".to_string(),
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
                username: "me@example.com".to_string(),
                password: "hunter2".to_string(),
            },
            Duration::from_secs(20),
        ));
        let client = OpendoorsClient::new(transport, authority, "https://api.example.com");
        SessionManager::new(client, options)
    }

    fn token_response() -> Result<HttpResponse> {
        Ok(HttpResponse::new(
            200,
            json!({"access_token": "T1", "expires_in": 3600}),
        ))
    }

    fn is_token_request(request: &HttpRequest) -> bool {
        request.url.ends_with("/token")
    }

    /// Token endpoint plus a fixed actuator list
    fn static_locks(locks: Value) -> Arc<ScriptedTransport> {
        ScriptedTransport::new(move |r| {
            if is_token_request(r) {
                token_response()
            } else if r.method == Method::GET {
                Ok(HttpResponse::new(200, locks.clone()))
            } else {
                Ok(HttpResponse::new(202, Value::Null))
            }
        })
    }

    fn two_doors() -> Value {
        json!([
            {"uid": "door-1", "name": "Front", "state": ["LOCKED"]},
            {"uid": "door-2", "name": "Back", "state": ["UNLOCKED", "JAMMED"]}
        ])
    }

    #[tokio::test]
    async fn test_connect_then_close_runs_nothing() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());

        session.connect().await.unwrap();
        assert!(session.is_connected().await);
        session.close().await;

        assert!(!session.is_connected().await);
        assert!(transport.requests().is_empty());
        assert!(session.locks().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = static_locks(two_doors());
        let session = session_with(transport, SessionOptions::default());

        session.close().await;
        session.connect().await.unwrap();
        session.close().await;
        session.close().await;
        assert!(!session.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cycle_replaces_cache_and_notifies() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.register_locks_callback(move |locks| {
            let _ = tx.send(locks.clone());
        });

        session.connect().await.unwrap();
        let delivered = rx.recv().await.unwrap();
        session.close().await;

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered["door-1"].name, "Front");
        assert_eq!(*session.locks(), delivered);
        assert!(session.lock("door-2").unwrap().state.len() == 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_activity_after_close() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        session.register_locks_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        session.close().await;

        let requests = transport.requests().len();
        let callbacks = notified.load(Ordering::SeqCst);
        assert_eq!(callbacks, 3);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.requests().len(), requests);
        assert_eq!(notified.load(Ordering::SeqCst), callbacks);
    }

    fn counting_callback(session: &SessionManager) -> Arc<AtomicUsize> {
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        session.register_locks_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        notified
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_fetching_locks() {
        let locks = two_doors();
        let transport =
            ScriptedTransport::delayed_matching("/actuators", Duration::from_secs(60), move |r| {
                if is_token_request(r) {
                    token_response()
                } else {
                    Ok(HttpResponse::new(200, locks.clone()))
                }
            });
        let session = session_with(transport.clone(), SessionOptions::default());
        let notified = counting_callback(&session);

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.count(&Method::GET, "/actuators"), 1);

        let started = tokio::time::Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_secs(60));

        let requests = transport.requests().len();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert!(session.locks().is_empty());
        assert_eq!(transport.requests().len(), requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_exchanging_token() {
        let transport = ScriptedTransport::delayed(Duration::from_secs(60), |r| {
            if is_token_request(r) {
                token_response()
            } else {
                Ok(HttpResponse::new(200, two_doors()))
            }
        });
        let session = session_with(transport.clone(), SessionOptions::default());
        let notified = counting_callback(&session);

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Both loops wait on the same exchange
        assert_eq!(transport.requests().len(), 1);

        let started = tokio::time::Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert!(session.locks().is_empty());
        assert!(session.authority().token().is_none());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_snapshot_and_loop_continues() {
        let gets = AtomicUsize::new(0);
        let transport = ScriptedTransport::new(move |r| {
            if is_token_request(r) {
                return token_response();
            }
            match gets.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(HttpResponse::new(200, two_doors())),
                1 => Err(Error::Transport("connection reset".to_string())),
                _ => Ok(HttpResponse::new(
                    200,
                    json!([{"uid": "door-3", "name": "Shed", "state": ["LOCKED"]}]),
                )),
            }
        });
        let session = session_with(transport.clone(), SessionOptions::default());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.register_locks_callback(move |locks| {
            let _ = tx.send(locks.clone());
        });
        session.connect().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);

        // Second cycle fails at t=30s
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.count(&Method::GET, "/actuators"), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.locks().len(), 2);

        let third = rx.recv().await.unwrap();
        session.close().await;

        assert_eq!(third.len(), 1);
        assert!(third.contains_key("door-3"));
        assert_eq!(*session.locks(), third);
    }

    #[tokio::test]
    async fn test_refresh_locks_failure_leaves_cache() {
        let gets = AtomicUsize::new(0);
        let transport = ScriptedTransport::new(move |r| {
            if is_token_request(r) {
                return token_response();
            }
            if gets.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(HttpResponse::new(200, two_doors()))
            } else {
                Ok(HttpResponse::new(500, json!({"error": "boom"})))
            }
        });
        let session = session_with(transport, SessionOptions::default());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        session.register_locks_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(session.refresh_locks().await.unwrap(), 2);
        let before = session.locks();

        let err = session.refresh_locks().await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
        assert_eq!(session.locks(), before);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let transport = static_locks(two_doors());
        let session = session_with(transport, SessionOptions::default());
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            session.register_locks_callback(move |locks| {
                calls.lock().unwrap().push((name, locks.len()));
            });
        }

        session.refresh_locks().await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("first", 2), ("second", 2), ("third", 2)]
        );
    }

    #[tokio::test]
    async fn test_lock_action_unknown_device() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());

        let err = session
            .lock_action("door-1", LockActionType::Lock)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(ref uid) if uid == "door-1"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_lock_action_does_not_touch_cache() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());
        session.refresh_locks().await.unwrap();
        let before = session.locks();

        session
            .lock_action("door-2", LockActionType::Lock)
            .await
            .unwrap();

        assert_eq!(transport.count(&Method::POST, "/actuators/door-2/actions"), 1);
        assert!(Arc::ptr_eq(&before, &session.locks()));
        assert!(!session.lock("door-2").unwrap().is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_noop() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());

        session.connect().await.unwrap();
        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.close().await;

        assert_eq!(transport.count(&Method::GET, "/actuators"), 1);
        assert_eq!(transport.count(&Method::POST, "/token"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_without_polling() {
        let transport = ScriptedTransport::new(|r| {
            if is_token_request(r) {
                Ok(HttpResponse::new(
                    200,
                    json!({"access_token": "T", "expires_in": 100}),
                ))
            } else {
                Ok(HttpResponse::new(200, json!([])))
            }
        });
        let options = SessionOptions {
            poll: false,
            ..SessionOptions::default()
        };
        let session = session_with(transport.clone(), options);

        session.connect().await.unwrap();
        // Ticks at 0s (exchange), 60s (still valid), 120s (expired, exchange)
        tokio::time::sleep(Duration::from_secs(125)).await;
        session.close().await;

        assert_eq!(transport.count(&Method::POST, "/token"), 2);
        assert_eq!(transport.count(&Method::GET, "/actuators"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_close() {
        let transport = static_locks(two_doors());
        let session = session_with(transport.clone(), SessionOptions::default());

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.close().await;

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.close().await;

        assert_eq!(transport.count(&Method::GET, "/actuators"), 2);
    }
}
