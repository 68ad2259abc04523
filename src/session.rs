use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// A session is evicted once it has been idle longer than this.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the background sweep. Coarser than the idle timeout, so the
/// effective cutoff lands anywhere between 60s and 90s of inactivity;
/// callers must not assume an exact 60s boundary.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One tunnel session: a client address bound to a single target base URL.
///
/// `target_base_url` and `client_ip` are fixed at creation and never mutated.
/// `last_active` is the sole input to expiry and is refreshed on every
/// validated access, keep-alives included. A credential later removed from
/// the directory does not invalidate an existing session; it lives on until
/// its own idle expiry.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub target_base_url: String,
    pub client_ip: IpAddr,
    pub last_active: Instant,
}

/// In-memory registry of live sessions, keyed by opaque token.
///
/// The store is the unit of synchronization: every read and write of the
/// collection goes through its one lock, and a reader never observes a
/// partially constructed record. Nothing persists; a restart drops all
/// sessions.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create the store and start its idle sweep, which runs for the
    /// lifetime of the process with no cancellation.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        });
        tokio::spawn(Self::sweep_loop(Arc::clone(&store)));
        store
    }

    /// Insert a new session and return its token.
    ///
    /// Tokens are 128-bit random UUIDs; collision among live sessions is
    /// treated as practically impossible rather than handled.
    pub async fn create_session(
        &self,
        username: &str,
        target_base_url: &str,
        client_ip: IpAddr,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        let session = Session {
            username: username.to_owned(),
            target_base_url: target_base_url.to_owned(),
            client_ip,
            last_active: Instant::now(),
        };
        self.sessions.write().await.insert(token.clone(), session);
        info!("session created for user '{username}' -> {target_base_url}");
        token
    }

    /// Look up a session. `None` covers both never-existed and already
    /// evicted; callers treat the two identically.
    pub async fn get_session(&self, token: &str) -> Option<Session> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Refresh a session's activity timestamp. A no-op for unknown tokens.
    pub async fn touch(&self, token: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(token) {
            session.last_active = Instant::now();
        }
    }

    async fn sweep_loop(store: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_idle(Instant::now()).await;
        }
    }

    /// Evict every session idle longer than [`IDLE_TIMEOUT`] as of `now`.
    /// The sweep is the only deleter of records.
    async fn purge_idle(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|token, session| {
            let keep = now.duration_since(session.last_active) <= IDLE_TIMEOUT;
            if !keep {
                debug!("session '{token}' for user '{}' expired", session.username);
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("idle sweep evicted {evicted} session(s)");
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn client_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = SessionStore::new();
        let token = store
            .create_session("alice", "http://up.example", client_ip())
            .await;

        let session = store.get_session(&token).await.expect("session exists");
        assert_eq!(session.username, "alice");
        assert_eq!(session.target_base_url, "http://up.example");
        assert_eq!(session.client_ip, client_ip());
    }

    #[tokio::test]
    async fn unknown_token_is_absent() {
        let store = SessionStore::new();
        assert!(store.get_session("no-such-token").await.is_none());
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let store = SessionStore::new();
        let mut tokens = HashSet::new();
        for _ in 0..100 {
            let token = store.create_session("alice", "http://a", client_ip()).await;
            assert!(tokens.insert(token), "duplicate session token");
        }
    }

    #[tokio::test]
    async fn purge_keeps_sessions_inside_the_window() {
        let store = SessionStore::new();
        let token = store.create_session("alice", "http://a", client_ip()).await;

        let evicted = store
            .purge_idle(Instant::now() + Duration::from_secs(30))
            .await;
        assert_eq!(evicted, 0);
        assert!(store.get_session(&token).await.is_some());
    }

    #[tokio::test]
    async fn purge_evicts_sessions_past_the_window() {
        let store = SessionStore::new();
        let token = store.create_session("alice", "http://a", client_ip()).await;

        let evicted = store
            .purge_idle(Instant::now() + Duration::from_secs(95))
            .await;
        assert_eq!(evicted, 1);
        assert!(store.get_session(&token).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_the_idle_clock() {
        let store = SessionStore::new();
        let token = store.create_session("alice", "http://a", client_ip()).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        store.touch(&token).await;
        tokio::time::advance(Duration::from_secs(40)).await;

        // 90s since creation, but only 40s since the touch.
        let evicted = store.purge_idle(Instant::now()).await;
        assert_eq!(evicted, 0);
        assert!(store.get_session(&token).await.is_some());
    }

    #[tokio::test]
    async fn touch_on_unknown_token_is_a_noop() {
        let store = SessionStore::new();
        store.touch("no-such-token").await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_evicts_idle_sessions() {
        let store = SessionStore::new();
        let token = store.create_session("alice", "http://a", client_ip()).await;

        // 95s idle spans at least one full sweep period past the cutoff.
        tokio::time::advance(Duration::from_secs(95)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(store.get_session(&token).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_access_on_one_token_all_succeed() {
        let store = SessionStore::new();
        let token = store.create_session("alice", "http://a", client_ip()).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let session = store.get_session(&token).await?;
                store.touch(&token).await;
                Some(session)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
    }
}
