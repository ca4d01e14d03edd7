//! The session manager.
//!
//! One manager runs per server process. It owns the registry of open
//! documents, starts a session the first time somebody connects to a
//! document, routes join requests to it and stops sessions that have had no
//! clients for [`CollabConfig::idle_timeout`].
//!
//! Like sessions, the manager is a task reachable only through its handle;
//! the registry is never touched from anywhere else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::session::{
    spawn_managed, Admitted, ClientConnection, LifecycleEvent, Rejected, SessionHandle,
    SessionStatus,
};
use crate::storage::DocumentStorage;
use crate::{QuireError, QuireResult};

enum ManagerCommand {
    Connect {
        doc_id: String,
        connection: ClientConnection,
        attempt: u32,
        reply: oneshot::Sender<QuireResult<Admitted>>,
    },
    IdleTimeout {
        doc_id: String,
        instance: Uuid,
        deadline: Instant,
    },
    StopOne {
        doc_id: String,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    Status {
        doc_id: String,
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
}

impl ManagerCommand {
    /// Answer a command that will never reach the manager
    fn abandon(self) {
        match self {
            ManagerCommand::Connect { reply, .. } => {
                let _ = reply.send(Err(QuireError::ManagerClosed));
            }
            ManagerCommand::StopAll { reply } => {
                let _ = reply.send(());
            }
            _ => {}
        }
    }
}

/// Registry entry for one open document
struct Entry {
    session: SessionHandle,
    status: SessionStatus,
    clients: usize,
    idle_deadline: Option<Instant>,
}

struct SessionManager {
    config: Arc<CollabConfig>,
    storage: Arc<dyn DocumentStorage>,
    commands: mpsc::Receiver<ManagerCommand>,
    handle: mpsc::WeakSender<ManagerCommand>,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    lifecycle: mpsc::Receiver<LifecycleEvent>,
    sessions: HashMap<String, Entry>,
    stopping: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

/// Cloneable address of the session manager
#[derive(Clone)]
pub struct SessionManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

/// Start the session manager
pub fn spawn_manager(
    storage: Arc<dyn DocumentStorage>,
    config: Arc<CollabConfig>,
) -> SessionManagerHandle {
    let capacity = config.manager_queue_capacity.max(1);
    let (tx, commands) = mpsc::channel(capacity);
    let (lifecycle_tx, lifecycle) = mpsc::channel(capacity);

    let manager = SessionManager {
        config,
        storage,
        commands,
        handle: tx.downgrade(),
        lifecycle_tx,
        lifecycle,
        sessions: HashMap::new(),
        stopping: false,
        stop_waiters: Vec::new(),
    };
    tokio::spawn(manager.run());

    SessionManagerHandle { tx }
}

impl SessionManagerHandle {
    /// Attach a connection to the session of `doc_id`, starting it if needed.
    ///
    /// Returns once the session has admitted the client. Joins that race a
    /// starting, stopping or busy session are retried after
    /// [`CollabConfig::join_retry_backoff`].
    pub async fn connect(
        &self,
        doc_id: impl Into<String>,
        connection: ClientConnection,
    ) -> QuireResult<Admitted> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Connect {
            doc_id: doc_id.into(),
            connection,
            attempt: 0,
            reply,
        })
        .await?;
        rx.await.map_err(|_| QuireError::ManagerClosed)?
    }

    /// Ask the session of `doc_id` to stop, without waiting for it
    pub async fn stop_one(&self, doc_id: impl Into<String>) -> QuireResult<()> {
        self.send(ManagerCommand::StopOne {
            doc_id: doc_id.into(),
        })
        .await
    }

    /// Stop every session and wait until all of them have terminated.
    ///
    /// The manager refuses new connections from then on and exits once the
    /// registry is empty.
    pub async fn stop_all(&self) -> QuireResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::StopAll { reply }).await.is_err() {
            // Already shut down
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Number of documents with a session in the registry
    pub async fn session_count(&self) -> QuireResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::SessionCount { reply }).await?;
        rx.await.map_err(|_| QuireError::ManagerClosed)
    }

    /// Registry status of the session for `doc_id`, if there is one
    pub async fn status(&self, doc_id: impl Into<String>) -> QuireResult<Option<SessionStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Status {
            doc_id: doc_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| QuireError::ManagerClosed)
    }

    async fn send(&self, command: ManagerCommand) -> QuireResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| QuireError::ManagerClosed)
    }
}

impl SessionManager {
    async fn run(mut self) {
        info!("Session manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All session manager handles dropped");
                        break;
                    };
                    self.handle_command(command);
                }
                Some(event) = self.lifecycle.recv() => self.handle_lifecycle(event),
            }

            if self.stopping && self.sessions.is_empty() {
                break;
            }
        }

        for entry in self.sessions.values() {
            request_stop(&entry.session);
        }
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.abandon();
        }
        info!("Session manager stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect {
                doc_id,
                connection,
                attempt,
                reply,
            } => self.connect(doc_id, connection, attempt, reply),
            ManagerCommand::IdleTimeout {
                doc_id,
                instance,
                deadline,
            } => self.idle_timeout(&doc_id, instance, deadline),
            ManagerCommand::StopOne { doc_id } => {
                if let Some(entry) = self.sessions.get_mut(&doc_id) {
                    info!("Stopping session for document '{}'", doc_id);
                    entry.status = SessionStatus::Stopping;
                    entry.idle_deadline = None;
                    request_stop(&entry.session);
                }
            }
            ManagerCommand::StopAll { reply } => {
                info!("Stopping all {} sessions", self.sessions.len());
                self.stopping = true;
                self.stop_waiters.push(reply);
                for entry in self.sessions.values_mut() {
                    entry.status = SessionStatus::Stopping;
                    entry.idle_deadline = None;
                    request_stop(&entry.session);
                }
            }
            ManagerCommand::SessionCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            ManagerCommand::Status { doc_id, reply } => {
                let _ = reply.send(self.sessions.get(&doc_id).map(|entry| entry.status));
            }
        }
    }

    fn connect(
        &mut self,
        doc_id: String,
        connection: ClientConnection,
        attempt: u32,
        reply: oneshot::Sender<QuireResult<Admitted>>,
    ) {
        if self.stopping {
            let _ = reply.send(Err(QuireError::ManagerClosed));
            return;
        }
        if attempt > self.config.join_retry_limit {
            warn!(
                "Giving up joining document '{}' after {} attempts",
                doc_id, attempt
            );
            let _ = reply.send(Err(QuireError::JoinTimedOut {
                id: doc_id,
                attempts: attempt,
            }));
            return;
        }

        if !self.sessions.contains_key(&doc_id) {
            self.start_session(&doc_id);
            self.retry_connect(doc_id, connection, attempt, reply);
            return;
        }
        let Some(entry) = self.sessions.get_mut(&doc_id) else {
            return;
        };
        if entry.status != SessionStatus::Running {
            debug!(
                "Session for '{}' is {:?}, retrying join",
                doc_id, entry.status
            );
            self.retry_connect(doc_id, connection, attempt, reply);
            return;
        }

        if entry.idle_deadline.take().is_some() {
            debug!("Cancelled idle stop of document '{}'", doc_id);
        }

        let (session_reply, session_rx) = oneshot::channel();
        match entry.session.try_add_client(connection, session_reply) {
            Ok(()) => {
                let manager = self.handle.clone();
                let backoff = self.config.join_retry_backoff();
                tokio::spawn(async move {
                    match session_rx.await {
                        Ok(Ok(admitted)) => {
                            let _ = reply.send(Ok(admitted));
                        }
                        Ok(Err(Rejected {
                            connection: Some(connection),
                            error,
                        })) => {
                            debug!("Join of '{}' rejected ({}), retrying", doc_id, error);
                            schedule(
                                manager,
                                backoff,
                                ManagerCommand::Connect {
                                    doc_id,
                                    connection,
                                    attempt: attempt + 1,
                                    reply,
                                },
                            );
                        }
                        Ok(Err(Rejected { error, .. })) => {
                            let _ = reply.send(Err(error));
                        }
                        Err(_) => {
                            let _ = reply.send(Err(QuireError::SessionUnavailable { id: doc_id }));
                        }
                    }
                });
            }
            Err(TrySendError::Full(command)) => {
                debug!("Inbox of session '{}' is full, retrying join", doc_id);
                match command.into_connection() {
                    Some(connection) => self.retry_connect(doc_id, connection, attempt, reply),
                    None => {
                        let _ = reply.send(Err(QuireError::Internal(
                            "join request lost its connection".to_string(),
                        )));
                    }
                }
            }
            Err(TrySendError::Closed(command)) => {
                // Still saving; the entry goes away with its Terminated event
                debug!("Session for '{}' is shutting down, retrying join", doc_id);
                entry.status = SessionStatus::Stopping;
                entry.idle_deadline = None;
                match command.into_connection() {
                    Some(connection) => self.retry_connect(doc_id, connection, attempt, reply),
                    None => {
                        let _ = reply.send(Err(QuireError::Internal(
                            "join request lost its connection".to_string(),
                        )));
                    }
                }
            }
        }
    }

    fn retry_connect(
        &self,
        doc_id: String,
        connection: ClientConnection,
        attempt: u32,
        reply: oneshot::Sender<QuireResult<Admitted>>,
    ) {
        schedule(
            self.handle.clone(),
            self.config.join_retry_backoff(),
            ManagerCommand::Connect {
                doc_id,
                connection,
                attempt: attempt + 1,
                reply,
            },
        );
    }

    fn start_session(&mut self, doc_id: &str) {
        let session = spawn_managed(
            doc_id.to_string(),
            self.storage.clone(),
            self.config.clone(),
            Some(self.lifecycle_tx.clone()),
        );
        info!(
            "Registered session {} for document '{}'",
            session.instance(),
            doc_id
        );
        self.sessions.insert(
            doc_id.to_string(),
            Entry {
                session,
                status: SessionStatus::Starting,
                clients: 0,
                idle_deadline: None,
            },
        );
    }

    fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Started { doc_id, instance } => {
                let Some(entry) = self.current(&doc_id, instance) else {
                    return;
                };
                if entry.status == SessionStatus::Starting {
                    entry.status = SessionStatus::Running;
                }
                if entry.status == SessionStatus::Running && entry.clients == 0 {
                    self.arm_idle(&doc_id);
                }
            }
            LifecycleEvent::ClientCount {
                doc_id,
                instance,
                count,
            } => {
                let Some(entry) = self.current(&doc_id, instance) else {
                    return;
                };
                entry.clients = count;
                if count > 0 {
                    entry.idle_deadline = None;
                } else if entry.status == SessionStatus::Running {
                    self.arm_idle(&doc_id);
                }
            }
            LifecycleEvent::Terminated { doc_id, instance } => {
                if self.current(&doc_id, instance).is_some() {
                    self.sessions.remove(&doc_id);
                    info!("Removed session {} of document '{}'", instance, doc_id);
                }
            }
        }
    }

    /// The registry entry for `doc_id`, unless it belongs to another instance
    fn current(&mut self, doc_id: &str, instance: Uuid) -> Option<&mut Entry> {
        let entry = self.sessions.get_mut(doc_id)?;
        if entry.session.instance() != instance {
            debug!(
                "Ignoring event from stale session {} of '{}'",
                instance, doc_id
            );
            return None;
        }
        Some(entry)
    }

    fn arm_idle(&mut self, doc_id: &str) {
        if self.stopping {
            return;
        }
        let Some(entry) = self.sessions.get_mut(doc_id) else {
            return;
        };

        let deadline = Instant::now() + self.config.idle_timeout();
        entry.idle_deadline = Some(deadline);
        debug!(
            "Document '{}' has no clients, stopping in {:?}",
            doc_id,
            self.config.idle_timeout()
        );

        let manager = self.handle.clone();
        let command = ManagerCommand::IdleTimeout {
            doc_id: doc_id.to_string(),
            instance: entry.session.instance(),
            deadline,
        };
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(tx) = manager.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    fn idle_timeout(&mut self, doc_id: &str, instance: Uuid, deadline: Instant) {
        let Some(entry) = self.current(doc_id, instance) else {
            return;
        };
        // A join or a newer timer superseded this one
        if entry.idle_deadline != Some(deadline) || entry.clients > 0 {
            return;
        }

        info!("Stopping idle session for document '{}'", doc_id);
        entry.idle_deadline = None;
        entry.status = SessionStatus::Stopping;
        request_stop(&entry.session);
    }
}

/// Send `command` back to the manager after `delay`
fn schedule(manager: mpsc::WeakSender<ManagerCommand>, delay: Duration, command: ManagerCommand) {
    tokio::spawn(async move {
        sleep(delay).await;
        let Some(tx) = manager.upgrade() else {
            command.abandon();
            return;
        };
        if let Err(mpsc::error::SendError(command)) = tx.send(command).await {
            command.abandon();
        }
    });
}

fn request_stop(session: &SessionHandle) {
    match session.try_stop() {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => {
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.stop().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Selection, ServerMessage};
    use crate::session::{Outbound, UserInfo};
    use crate::storage::{MemoryStorage, Permission, Profile, StoredDocument};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    /// Storage whose saves can be failed once, slowed down or held back
    struct ControlledStorage {
        inner: MemoryStorage,
        fail_next_save: AtomicBool,
        save_delay: Duration,
        gate: Semaphore,
    }

    impl ControlledStorage {
        fn new(text: &str, save_delay: Duration, open: bool) -> Arc<Self> {
            let inner = MemoryStorage::new();
            inner.insert_document(
                "doc",
                StoredDocument {
                    owner_id: "owner".to_string(),
                    permission: Permission::PublicEdit,
                    text: text.to_string(),
                },
            );
            let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
            Arc::new(Self {
                inner,
                fail_next_save: AtomicBool::new(false),
                save_delay,
                gate: Semaphore::new(permits),
            })
        }

        fn open_gate(&self) {
            self.gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    #[async_trait]
    impl DocumentStorage for ControlledStorage {
        async fn get_document(&self, id: &str) -> QuireResult<StoredDocument> {
            self.inner.get_document(id).await
        }

        async fn save_document(&self, id: &str, updater_id: &str, text: &str) -> QuireResult<()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(QuireError::Storage("disk full".to_string()));
            }
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| QuireError::Storage("gate closed".to_string()))?;
            sleep(self.save_delay).await;
            self.inner.save_document(id, updater_id, text).await
        }

        async fn touch_document_metadata(&self, id: &str, updater_id: &str) -> QuireResult<()> {
            self.inner.touch_document_metadata(id, updater_id).await
        }

        async fn get_profile(&self, user_id: &str) -> QuireResult<Profile> {
            self.inner.get_profile(user_id).await
        }
    }

    fn storage_with(ids: &[&str]) -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        for id in ids {
            storage.insert_document(
                *id,
                StoredDocument {
                    owner_id: "owner".to_string(),
                    permission: Permission::PublicEdit,
                    text: format!("text of {}", id),
                },
            );
        }
        storage
    }

    fn manager(storage: &Arc<MemoryStorage>, config: CollabConfig) -> SessionManagerHandle {
        spawn_manager(storage.clone(), Arc::new(config))
    }

    fn connection(id: &str) -> (ClientConnection, mpsc::UnboundedReceiver<Outbound>) {
        ClientConnection::new(
            UserInfo {
                id: id.to_string(),
                name: id.to_string(),
                avatar: None,
            },
            true,
        )
    }

    async fn wait_closed(rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        loop {
            match timeout(Duration::from_secs(60), rx.recv()).await {
                Ok(Some(Outbound::Close)) | Ok(None) => return,
                Ok(Some(Outbound::Message(_))) => continue,
                Err(_) => panic!("client was never closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_one_session_per_document() {
        let storage = storage_with(&["doc"]);
        let manager = manager(&storage, CollabConfig::default());

        let (first, _first_rx) = connection("alice");
        let (second, _second_rx) = connection("bob");
        let (a, b) = tokio::join!(manager.connect("doc", first), manager.connect("doc", second));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.session.instance(), b.session.instance());
        assert_ne!(a.client_id, b.client_id);
        assert_eq!(manager.session_count().await.unwrap(), 1);
        assert_eq!(
            manager.status("doc").await.unwrap(),
            Some(SessionStatus::Running)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_stopped() {
        let storage = storage_with(&["doc"]);
        let manager = manager(&storage, CollabConfig::default());

        let (conn, _rx) = connection("alice");
        let admitted = manager.connect("doc", conn).await.unwrap();
        admitted.session.remove_client(admitted.client_id).await.unwrap();

        sleep(Duration::from_secs(29)).await;
        assert_eq!(manager.session_count().await.unwrap(), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.session_count().await.unwrap(), 0);
        assert_eq!(manager.status("doc").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_cancels_idle_stop() {
        let storage = storage_with(&["doc"]);
        let manager = manager(&storage, CollabConfig::default());

        let (conn, _rx) = connection("alice");
        let first = manager.connect("doc", conn).await.unwrap();
        first.session.remove_client(first.client_id).await.unwrap();

        sleep(Duration::from_secs(20)).await;
        let (conn, _bob_rx) = connection("bob");
        let second = manager.connect("doc", conn).await.unwrap();

        sleep(Duration::from_secs(20)).await;
        assert_eq!(second.session.instance(), first.session.instance());
        assert_eq!(
            manager.status("doc").await.unwrap(),
            Some(SessionStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_every_session() {
        let storage = storage_with(&["one", "two"]);
        let manager = manager(&storage, CollabConfig::default());

        let (conn, mut one_rx) = connection("alice");
        let one = manager.connect("one", conn).await.unwrap();
        let (conn, mut two_rx) = connection("bob");
        manager.connect("two", conn).await.unwrap();

        let mut quote = crate::ot::OperationSeq::new();
        quote.insert("> ").retain(11);
        one.session
            .submit_edit(one.client_id, 0, quote, None)
            .await
            .unwrap();

        manager.stop_all().await.unwrap();

        wait_closed(&mut one_rx).await;
        wait_closed(&mut two_rx).await;
        assert_eq!(storage.document("one").unwrap().text, "> text of one");
        assert!(one.session.is_closed());

        let (conn, _rx) = connection("carol");
        assert!(matches!(
            manager.connect("one", conn).await,
            Err(QuireError::ManagerClosed)
        ));
        // Stopping twice is harmless
        manager.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_one_then_reconnect() {
        let storage = storage_with(&["doc"]);
        let manager = manager(&storage, CollabConfig::default());

        let (conn, mut rx) = connection("alice");
        let first = manager.connect("doc", conn).await.unwrap();

        manager.stop_one("doc").await.unwrap();
        wait_closed(&mut rx).await;

        let (conn, _rx) = connection("alice");
        let second = manager.connect("doc", conn).await.unwrap();
        assert_ne!(second.session.instance(), first.session.instance());
        assert_eq!(manager.session_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_document_times_out() {
        let storage = storage_with(&[]);
        let config = CollabConfig {
            join_retry_limit: 3,
            ..CollabConfig::default()
        };
        let manager = manager(&storage, config);

        let (conn, _rx) = connection("alice");
        let result = manager.connect("nope", conn).await;
        assert!(matches!(result, Err(QuireError::JoinTimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_stopping_session_to_save() {
        let storage = ControlledStorage::new("x", Duration::from_millis(500), true);
        let manager = spawn_manager(storage.clone(), Arc::new(CollabConfig::default()));

        let (conn, mut alice_rx) = connection("alice");
        let alice = manager.connect("doc", conn).await.unwrap();
        let (conn, _bob_rx) = connection("bob");
        let bob = manager.connect("doc", conn).await.unwrap();

        let mut edit = crate::ot::OperationSeq::new();
        edit.insert("y").retain(1);
        alice
            .session
            .submit_edit(alice.client_id, 0, edit, None)
            .await
            .unwrap();

        // The save after bob leaves fails and the session stops itself
        storage.fail_next_save.store(true, Ordering::SeqCst);
        bob.session.remove_client(bob.client_id).await.unwrap();
        wait_closed(&mut alice_rx).await;

        let (conn, mut carol_rx) = connection("carol");
        let carol = manager.connect("doc", conn).await.unwrap();

        assert_ne!(carol.session.instance(), alice.session.instance());
        assert!(alice.session.is_closed());
        assert_eq!(storage.inner.document("doc").unwrap().text, "yx");
        match carol_rx.recv().await {
            Some(Outbound::Message(ServerMessage::Doc(doc))) => assert_eq!(doc.text, "yx"),
            other => panic!("Expected doc snapshot, got: {:?}", other),
        }
        assert_eq!(manager.session_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_while_inbox_is_full() {
        let storage = ControlledStorage::new("x", Duration::ZERO, false);
        let config = CollabConfig {
            session_queue_capacity: 1,
            ..CollabConfig::default()
        };
        let manager = spawn_manager(storage.clone(), Arc::new(config));

        let (conn, _alice_rx) = connection("alice");
        let alice = manager.connect("doc", conn).await.unwrap();
        let (conn, _bob_rx) = connection("bob");
        let bob = manager.connect("doc", conn).await.unwrap();

        let mut edit = crate::ot::OperationSeq::new();
        edit.insert("y").retain(1);
        alice
            .session
            .submit_edit(alice.client_id, 0, edit, None)
            .await
            .unwrap();

        // The session blocks saving after bob leaves; the next command fills its inbox
        bob.session.remove_client(bob.client_id).await.unwrap();
        alice
            .session
            .submit_selection(alice.client_id, Selection::cursor(1))
            .await
            .unwrap();

        let (conn, _carol_rx) = connection("carol");
        let joining = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect("doc", conn).await })
        };
        sleep(Duration::from_millis(300)).await;
        assert!(!joining.is_finished());

        storage.open_gate();
        let carol = timeout(Duration::from_secs(5), joining)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(carol.session.instance(), alice.session.instance());
        assert_eq!(storage.inner.document("doc").unwrap().text, "yx");
    }
}
