//! Document sessions.
//!
//! A session is a task that exclusively owns one open document. Other
//! components talk to it only through a [`SessionHandle`], which queues
//! commands on the session's bounded inbox; every edit of a document is
//! therefore transformed and applied one at a time.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::ot::OperationSeq;
use crate::protocol::{ClientId, Selection};
use crate::storage::DocumentStorage;
use crate::{QuireError, QuireResult};

mod actor;
pub mod client;
pub mod document;

pub use client::{ClientConnection, Outbound, UserInfo};
pub use document::DocumentState;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Loading the document; commands are queued until loading finishes
    Starting,
    Running,
    /// Detaching clients and saving; no new clients are admitted
    Stopping,
    Terminated,
}

pub(crate) enum SessionCommand {
    AddClient {
        connection: ClientConnection,
        reply: oneshot::Sender<Result<Admitted, Rejected>>,
    },
    SubmitEdit {
        client_id: ClientId,
        base_revision: u64,
        operations: OperationSeq,
        selection: Option<Selection>,
    },
    SubmitSelection {
        client_id: ClientId,
        selection: Selection,
    },
    RemoveClient {
        client_id: ClientId,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Stop,
}

impl SessionCommand {
    /// Take back the connection carried by an undelivered join request
    pub(crate) fn into_connection(self) -> Option<ClientConnection> {
        match self {
            SessionCommand::AddClient { connection, .. } => Some(connection),
            _ => None,
        }
    }
}

/// A client was admitted to a session
#[derive(Debug)]
pub struct Admitted {
    pub client_id: ClientId,
    pub session: SessionHandle,
}

/// A join request the session could not honour
///
/// The connection is handed back so the caller can try another session.
#[derive(Debug)]
pub struct Rejected {
    pub connection: Option<ClientConnection>,
    pub error: QuireError,
}

/// Diagnostic view of one attached client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub id: ClientId,
    pub user_id: String,
    pub editable: bool,
    pub last_acknowledged: u64,
    pub selection: Selection,
}

/// Diagnostic view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub text: String,
    pub revision: u64,
    pub history_revisions: Vec<u64>,
    pub clients: Vec<ClientSummary>,
    pub dirty: bool,
}

/// Notifications a managed session sends to the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleEvent {
    Started {
        doc_id: String,
        instance: Uuid,
    },
    ClientCount {
        doc_id: String,
        instance: Uuid,
        count: usize,
    },
    Terminated {
        doc_id: String,
        instance: Uuid,
    },
}

/// Cloneable address of a running session
#[derive(Clone)]
pub struct SessionHandle {
    doc_id: Arc<str>,
    instance: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("doc_id", &self.doc_id)
            .field("instance", &self.instance)
            .finish()
    }
}

impl SessionHandle {
    /// The document this session owns
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Unique ID of this session instance
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// True once the session no longer accepts commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Admit a client, waiting until the session has processed the request
    pub async fn add_client(&self, connection: ClientConnection) -> Result<Admitted, Rejected> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) = self
            .tx
            .send(SessionCommand::AddClient { connection, reply })
            .await
        {
            return Err(Rejected {
                connection: command.into_connection(),
                error: self.unavailable(),
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(Rejected {
                connection: None,
                error: self.unavailable(),
            })
        })
    }

    /// Queue a join request without waiting for room in the inbox
    pub(crate) fn try_add_client(
        &self,
        connection: ClientConnection,
        reply: oneshot::Sender<Result<Admitted, Rejected>>,
    ) -> Result<(), mpsc::error::TrySendError<SessionCommand>> {
        self.tx
            .try_send(SessionCommand::AddClient { connection, reply })
    }

    /// Submit an edit made against `base_revision`
    pub async fn submit_edit(
        &self,
        client_id: ClientId,
        base_revision: u64,
        operations: OperationSeq,
        selection: Option<Selection>,
    ) -> QuireResult<()> {
        self.send(SessionCommand::SubmitEdit {
            client_id,
            base_revision,
            operations,
            selection,
        })
        .await
    }

    /// Replace a client's selection and share it with everyone else
    pub async fn submit_selection(
        &self,
        client_id: ClientId,
        selection: Selection,
    ) -> QuireResult<()> {
        self.send(SessionCommand::SubmitSelection {
            client_id,
            selection,
        })
        .await
    }

    /// Detach a client
    pub async fn remove_client(&self, client_id: ClientId) -> QuireResult<()> {
        self.send(SessionCommand::RemoveClient { client_id }).await
    }

    /// Ask the session to detach everyone, save and terminate
    pub async fn stop(&self) -> QuireResult<()> {
        self.send(SessionCommand::Stop).await
    }

    /// Non-blocking variant of [`stop`](Self::stop)
    pub(crate) fn try_stop(&self) -> Result<(), mpsc::error::TrySendError<SessionCommand>> {
        self.tx.try_send(SessionCommand::Stop)
    }

    /// Current state of the session, for diagnostics
    pub async fn snapshot(&self) -> QuireResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    async fn send(&self, command: SessionCommand) -> QuireResult<()> {
        self.tx.send(command).await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> QuireError {
        QuireError::SessionUnavailable {
            id: self.doc_id.to_string(),
        }
    }
}

/// Start an unmanaged session for a document
///
/// The session loads the document from `storage` and keeps running until it
/// is stopped or every handle to it has been dropped.
pub fn spawn_session(
    doc_id: impl Into<String>,
    storage: Arc<dyn DocumentStorage>,
    config: Arc<CollabConfig>,
) -> SessionHandle {
    spawn_managed(doc_id.into(), storage, config, None)
}

pub(crate) fn spawn_managed(
    doc_id: String,
    storage: Arc<dyn DocumentStorage>,
    config: Arc<CollabConfig>,
    lifecycle: Option<mpsc::Sender<LifecycleEvent>>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(config.session_queue_capacity.max(1));
    let handle = SessionHandle {
        doc_id: Arc::from(doc_id.as_str()),
        instance: Uuid::new_v4(),
        tx,
    };

    let session = actor::Session::new(&handle, storage, config, rx, lifecycle);
    tokio::spawn(session.run());
    handle
}
