use tokio::sync::mpsc;

use crate::protocol::{ClientId, PeerInfo, PeerJoined, Selection, ServerMessage};

/// Identity of the user behind a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

/// What a session pushes to a connected client
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// The session dropped this client; the connection must be closed
    Close,
}

/// Everything a session needs to admit a connection
#[derive(Debug)]
pub struct ClientConnection {
    pub user: UserInfo,
    pub editable: bool,
    pub outbox: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    /// Create a connection along with the receiving end of its outbox
    pub fn new(user: UserInfo, editable: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                user,
                editable,
                outbox,
            },
            rx,
        )
    }
}

/// A client attached to a session
#[derive(Debug)]
pub(crate) struct ClientRecord {
    pub id: ClientId,
    pub user: UserInfo,
    pub editable: bool,
    pub last_acknowledged: u64,
    pub selection: Selection,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl ClientRecord {
    pub fn new(id: ClientId, connection: ClientConnection, revision: u64) -> Self {
        Self {
            id,
            user: connection.user,
            editable: connection.editable,
            last_acknowledged: revision,
            selection: Selection::default(),
            outbox: connection.outbox,
        }
    }

    /// Queue a message; a closed outbox is detached by its adapter
    pub fn send(&self, message: ServerMessage) {
        if self.outbox.send(Outbound::Message(message)).is_err() {
            tracing::debug!("Outbox of client {} is closed", self.id);
        }
    }

    pub fn close(&self) {
        let _ = self.outbox.send(Outbound::Close);
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.user.name.clone(),
            avatar: self.user.avatar.clone(),
            selection: self.selection.clone(),
        }
    }

    pub fn joined_notice(&self) -> PeerJoined {
        PeerJoined {
            id: self.id,
            name: self.user.name.clone(),
            avatar: self.user.avatar.clone(),
        }
    }
}
