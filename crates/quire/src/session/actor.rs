use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{ClientConnection, ClientRecord};
use super::{
    Admitted, ClientSummary, DocumentState, LifecycleEvent, Rejected, SessionCommand,
    SessionHandle, SessionSnapshot, SessionStatus,
};
use crate::config::{CollabConfig, ViolationPolicy};
use crate::ot::OperationSeq;
use crate::protocol::{ClientId, DocSnapshot, Selection, ServerMessage};
use crate::storage::{DocumentStorage, Permission};
use crate::{QuireError, QuireResult};

/// The control loop that owns one document
pub(super) struct Session {
    doc_id: String,
    instance: Uuid,
    handle: mpsc::WeakSender<SessionCommand>,
    config: Arc<CollabConfig>,
    storage: Arc<dyn DocumentStorage>,
    commands: mpsc::Receiver<SessionCommand>,
    lifecycle: Option<mpsc::Sender<LifecycleEvent>>,

    status: SessionStatus,
    state: DocumentState,
    owner_id: String,
    permission: Permission,
    clients: BTreeMap<ClientId, ClientRecord>,
    next_client_id: u64,
    dirty: bool,
    last_updater: Option<String>,
    edits_since_gc: usize,
}

impl Session {
    pub(super) fn new(
        handle: &SessionHandle,
        storage: Arc<dyn DocumentStorage>,
        config: Arc<CollabConfig>,
        commands: mpsc::Receiver<SessionCommand>,
        lifecycle: Option<mpsc::Sender<LifecycleEvent>>,
    ) -> Self {
        Self {
            doc_id: handle.doc_id().to_string(),
            instance: handle.instance(),
            handle: handle.tx.downgrade(),
            config,
            storage,
            commands,
            lifecycle,
            status: SessionStatus::Starting,
            state: DocumentState::default(),
            owner_id: String::new(),
            permission: Permission::default(),
            clients: BTreeMap::new(),
            next_client_id: 1,
            dirty: false,
            last_updater: None,
            edits_since_gc: 0,
        }
    }

    pub(super) async fn run(mut self) {
        info!(
            "Session {} for document '{}' starting",
            self.instance, self.doc_id
        );

        match self.storage.get_document(&self.doc_id).await {
            Ok(document) => {
                self.state = DocumentState::new(document.text);
                self.owner_id = document.owner_id;
                self.permission = document.permission;
            }
            Err(e) => {
                error!("Failed to load document '{}': {}", self.doc_id, e);
                self.shutdown().await;
                return;
            }
        }

        self.status = SessionStatus::Running;
        info!("Session for document '{}' running", self.doc_id);
        self.report(LifecycleEvent::Started {
            doc_id: self.doc_id.clone(),
            instance: self.instance,
        })
        .await;

        let period = self.config.save_interval().max(Duration::from_millis(1));
        let mut save_timer = interval_at(Instant::now() + period, period);
        save_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles to document '{}' dropped", self.doc_id);
                        break;
                    };
                    if matches!(command, SessionCommand::Stop) {
                        info!("Stop requested for document '{}'", self.doc_id);
                        break;
                    }
                    if let Err(e) = self.handle_command(command).await {
                        error!(
                            "Stopping session for document '{}' after storage failure: {}",
                            self.doc_id, e
                        );
                        break;
                    }
                }
                _ = save_timer.tick() => {
                    if let Err(e) = self.save().await {
                        error!(
                            "Stopping session for document '{}' after storage failure: {}",
                            self.doc_id, e
                        );
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) -> QuireResult<()> {
        match command {
            SessionCommand::AddClient { connection, reply } => {
                self.add_client(connection, reply);
                self.report_client_count().await;
            }
            SessionCommand::SubmitEdit {
                client_id,
                base_revision,
                operations,
                selection,
            } => {
                if let Err(e) = self.submit_edit(client_id, base_revision, operations, selection)
                {
                    self.handle_violation(client_id, e).await;
                }
            }
            SessionCommand::SubmitSelection {
                client_id,
                selection,
            } => self.submit_selection(client_id, selection),
            SessionCommand::RemoveClient { client_id } => {
                if self.detach(client_id, false) {
                    self.report_client_count().await;
                    self.save().await?;
                }
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Stop => {}
        }
        Ok(())
    }

    fn add_client(
        &mut self,
        connection: ClientConnection,
        reply: oneshot::Sender<Result<Admitted, Rejected>>,
    ) {
        let Some(sender) = self.handle.upgrade() else {
            let _ = reply.send(Err(Rejected {
                connection: Some(connection),
                error: self.unavailable(),
            }));
            return;
        };

        let client_id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        let record = ClientRecord::new(client_id, connection, self.state.revision());

        record.send(ServerMessage::Doc(DocSnapshot {
            client_id,
            text: self.state.text().to_string(),
            revision: self.state.revision(),
            owner: self.owner_id.clone(),
            permission: self.permission,
            editable: record.editable,
            clients: self
                .clients
                .iter()
                .map(|(id, client)| (*id, client.peer_info()))
                .collect(),
        }));
        self.broadcast(ServerMessage::Join(record.joined_notice()), None);

        info!(
            "Client {} ({}) joined document '{}' at revision {}",
            client_id,
            record.user.id,
            self.doc_id,
            self.state.revision()
        );
        self.clients.insert(client_id, record);

        let admitted = Admitted {
            client_id,
            session: SessionHandle {
                doc_id: Arc::from(self.doc_id.as_str()),
                instance: self.instance,
                tx: sender,
            },
        };
        if reply.send(Ok(admitted)).is_err() {
            debug!(
                "Client {} gave up before being admitted to '{}'",
                client_id, self.doc_id
            );
            self.detach(client_id, true);
        }
    }

    fn submit_edit(
        &mut self,
        client_id: ClientId,
        base_revision: u64,
        operations: OperationSeq,
        selection: Option<Selection>,
    ) -> QuireResult<()> {
        let Some(record) = self.clients.get(&client_id) else {
            debug!(
                "Ignoring edit from detached client {} on '{}'",
                client_id, self.doc_id
            );
            return Ok(());
        };
        if !record.editable {
            return Err(QuireError::PermissionViolation {
                client_id: client_id.0,
            });
        }
        let user_id = record.user.id.clone();

        let effective = self.state.apply_edit(base_revision, operations)?;
        let revision = self.state.revision();

        for (id, client) in self.clients.iter_mut() {
            if *id == client_id {
                client.last_acknowledged = revision;
                if let Some(selection) = &selection {
                    client.selection = selection.clone();
                }
            } else {
                client.selection = client.selection.transform(&effective);
            }
        }

        self.broadcast(
            ServerMessage::Op(client_id, effective, selection),
            Some(client_id),
        );
        if let Some(record) = self.clients.get(&client_id) {
            record.send(ServerMessage::Ok);
        }

        self.dirty = true;
        self.last_updater = Some(user_id);
        debug!(
            "Applied edit from client {} to '{}' (base {}, now {})",
            client_id, self.doc_id, base_revision, revision
        );

        self.edits_since_gc += 1;
        if self.edits_since_gc > self.config.gc_threshold {
            self.collect_garbage();
        }
        Ok(())
    }

    fn submit_selection(&mut self, client_id: ClientId, selection: Selection) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        client.selection = selection.clone();
        self.broadcast(ServerMessage::Sel(client_id, selection), Some(client_id));
    }

    async fn handle_violation(&mut self, client_id: ClientId, error: QuireError) {
        match self.config.violation_policy {
            ViolationPolicy::Disconnect => {
                warn!(
                    "Disconnecting client {} from document '{}': {}",
                    client_id, self.doc_id, error
                );
                if self.detach(client_id, true) {
                    self.report_client_count().await;
                }
            }
            ViolationPolicy::Reject => {
                warn!(
                    "Rejecting request from client {} on document '{}': {}",
                    client_id, self.doc_id, error
                );
                if let Some(client) = self.clients.get(&client_id) {
                    client.send(ServerMessage::Error {
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    /// Trim history no attached client can still reference
    fn collect_garbage(&mut self) {
        let min_acknowledged = self
            .clients
            .values()
            .map(|client| client.last_acknowledged)
            .min()
            .unwrap_or(self.state.revision());
        let removed = self.state.collect_garbage(min_acknowledged);
        self.edits_since_gc = 0;

        debug!(
            "Collected {} history entries of '{}' below revision {}",
            removed, self.doc_id, min_acknowledged
        );
    }

    /// Remove a client and tell everyone else; returns false if it was not attached
    fn detach(&mut self, client_id: ClientId, close: bool) -> bool {
        let Some(record) = self.clients.remove(&client_id) else {
            return false;
        };
        if close {
            record.close();
        }
        self.broadcast(ServerMessage::Quit(client_id), None);

        info!(
            "Client {} ({}) left document '{}'",
            client_id, record.user.id, self.doc_id
        );
        true
    }

    fn broadcast(&self, message: ServerMessage, except: Option<ClientId>) {
        for (id, client) in &self.clients {
            if Some(*id) != except {
                client.send(message.clone());
            }
        }
    }

    /// Persist the text if it changed since the last save
    async fn save(&mut self) -> QuireResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let updater = self
            .last_updater
            .clone()
            .unwrap_or_else(|| self.owner_id.clone());
        self.storage
            .save_document(&self.doc_id, &updater, self.state.text())
            .await?;
        self.storage
            .touch_document_metadata(&self.doc_id, &updater)
            .await?;
        self.dirty = false;

        info!(
            "Saved document '{}' at revision {}",
            self.doc_id,
            self.state.revision()
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.status = SessionStatus::Stopping;
        self.commands.close();

        let attached: Vec<ClientId> = self.clients.keys().copied().collect();
        for client_id in attached {
            self.detach(client_id, true);
        }

        // Answer whatever was still queued behind the stop
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::AddClient { connection, reply } => {
                    let _ = reply.send(Err(Rejected {
                        connection: Some(connection),
                        error: self.unavailable(),
                    }));
                }
                SessionCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                _ => {}
            }
        }

        if let Err(e) = self.save().await {
            error!("Final save of document '{}' failed: {}", self.doc_id, e);
        }

        self.status = SessionStatus::Terminated;
        info!(
            "Session {} for document '{}' terminated",
            self.instance, self.doc_id
        );
        self.report(LifecycleEvent::Terminated {
            doc_id: self.doc_id.clone(),
            instance: self.instance,
        })
        .await;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            text: self.state.text().to_string(),
            revision: self.state.revision(),
            history_revisions: self.state.history_revisions(),
            clients: self
                .clients
                .values()
                .map(|client| ClientSummary {
                    id: client.id,
                    user_id: client.user.id.clone(),
                    editable: client.editable,
                    last_acknowledged: client.last_acknowledged,
                    selection: client.selection.clone(),
                })
                .collect(),
            dirty: self.dirty,
        }
    }

    async fn report_client_count(&self) {
        self.report(LifecycleEvent::ClientCount {
            doc_id: self.doc_id.clone(),
            instance: self.instance,
            count: self.clients.len(),
        })
        .await;
    }

    async fn report(&self, event: LifecycleEvent) {
        if let Some(lifecycle) = &self.lifecycle {
            let _ = lifecycle.send(event).await;
        }
    }

    fn unavailable(&self) -> QuireError {
        QuireError::SessionUnavailable {
            id: self.doc_id.clone(),
        }
    }
}
