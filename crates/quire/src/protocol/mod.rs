use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ot::OperationSeq;
use crate::storage::Permission;

/// Session-scoped identifier of an attached client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One selected range; `anchor == head` is a plain cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: usize,
    pub head: usize,
}

/// A client's current selection, in UTF-16 offsets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub ranges: Vec<SelectionRange>,
}

impl Selection {
    pub fn cursor(offset: usize) -> Self {
        Self {
            ranges: vec![SelectionRange {
                anchor: offset,
                head: offset,
            }],
        }
    }

    /// Move every range through an edit so it addresses the edited text
    pub fn transform(&self, op: &OperationSeq) -> Selection {
        Selection {
            ranges: self
                .ranges
                .iter()
                .map(|range| SelectionRange {
                    anchor: op.transform_index(range.anchor),
                    head: op.transform_index(range.head),
                })
                .collect(),
        }
    }
}

/// What another client looks like to a newly joined one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub avatar: Option<String>,
    pub selection: Selection,
}

/// Full state sent to a client right after it joins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub client_id: ClientId,
    pub text: String,
    pub revision: u64,
    pub owner: String,
    pub permission: Permission,
    pub editable: bool,
    pub clients: BTreeMap<ClientId, PeerInfo>,
}

/// Announcement of a client that just joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJoined {
    pub id: ClientId,
    pub name: String,
    pub avatar: Option<String>,
}

/// Messages sent from client to server
///
/// Every frame is an envelope `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    /// `[baseRevision, operations, selection]`
    Op(u64, OperationSeq, Option<Selection>),
    /// New selection of the sending client
    Sel(Selection),
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full snapshot, sent once after joining
    Doc(DocSnapshot),
    /// Another client joined
    Join(PeerJoined),
    /// `[clientId, effectiveOperations, selection]` of an accepted edit
    Op(ClientId, OperationSeq, Option<Selection>),
    /// The submitter's own edit was accepted
    Ok,
    /// `[clientId, selection]` of another client
    Sel(ClientId, Selection),
    /// Another client left
    Quit(ClientId),
    /// A rejected request, when the session does not disconnect offenders
    Error { message: String },
}

/// Encode a message as a JSON text frame
pub fn encode_text<T: Serialize>(message: &T) -> crate::QuireResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a message from a JSON text frame
pub fn decode_text<T: for<'de> Deserialize<'de>>(text: &str) -> crate::QuireResult<T> {
    serde_json::from_str(text)
        .map_err(|e| crate::QuireError::protocol(format!("Malformed frame: {}", e)))
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::QuireResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::QuireResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json = lib0::decoding::Read::read_string(&mut decoder)
        .map_err(|e| crate::QuireError::protocol(format!("Failed to decode lib0 string: {}", e)))?;

    decode_text(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_op_envelope() {
        let frame = r#"{"event":"op","data":[4,[2,"hi",-1],{"ranges":[{"anchor":4,"head":4}]}]}"#;
        let message: ClientMessage = decode_text(frame).unwrap();

        let mut expected = OperationSeq::new();
        expected.retain(2).insert("hi").delete(1);
        assert_eq!(
            message,
            ClientMessage::Op(4, expected, Some(Selection::cursor(4)))
        );
    }

    #[test]
    fn test_client_op_without_selection() {
        let message: ClientMessage = decode_text(r#"{"event":"op","data":[0,["x"],null]}"#).unwrap();
        assert!(matches!(message, ClientMessage::Op(0, _, None)));
    }

    #[test]
    fn test_client_sel_envelope() {
        let message: ClientMessage =
            decode_text(r#"{"event":"sel","data":{"ranges":[{"anchor":1,"head":3}]}}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::Sel(Selection {
                ranges: vec![SelectionRange { anchor: 1, head: 3 }]
            })
        );
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        let result = decode_text::<ClientMessage>(r#"{"event":"nope","data":1}"#);
        assert!(matches!(result, Err(crate::QuireError::Protocol { .. })));
    }

    #[test]
    fn test_server_messages_shape() {
        let mut op = OperationSeq::new();
        op.retain(1).insert("a");
        let value = serde_json::to_value(ServerMessage::Op(ClientId(7), op, None)).unwrap();
        assert_eq!(value, json!({"event": "op", "data": [7, [1, "a"], null]}));

        let value = serde_json::to_value(ServerMessage::Ok).unwrap();
        assert_eq!(value, json!({"event": "ok"}));

        let value = serde_json::to_value(ServerMessage::Quit(ClientId(3))).unwrap();
        assert_eq!(value, json!({"event": "quit", "data": 3}));
    }

    #[test]
    fn test_snapshot_clients_keyed_by_id() {
        let mut clients = BTreeMap::new();
        clients.insert(
            ClientId(2),
            PeerInfo {
                name: "Ada".to_string(),
                avatar: None,
                selection: Selection::default(),
            },
        );
        let snapshot = ServerMessage::Doc(DocSnapshot {
            client_id: ClientId(3),
            text: "hello".to_string(),
            revision: 9,
            owner: "owner-1".to_string(),
            permission: Permission::PublicEdit,
            editable: true,
            clients,
        });

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["data"]["clients"]["2"]["name"], json!("Ada"));
        assert_eq!(value["data"]["permission"], json!("public_edit"));
    }

    #[test]
    fn test_lib0_framing() {
        let encoded = encode_message(&ServerMessage::Quit(ClientId(1))).unwrap();
        let decoded: ServerMessage = decode_message(&encoded).unwrap();
        assert_eq!(decoded, ServerMessage::Quit(ClientId(1)));
    }

    #[test]
    fn test_selection_follows_edit() {
        let mut op = OperationSeq::new();
        op.insert("abc").retain(5);
        let selection = Selection {
            ranges: vec![SelectionRange { anchor: 0, head: 5 }],
        };
        assert_eq!(
            selection.transform(&op).ranges,
            vec![SelectionRange { anchor: 3, head: 8 }]
        );
    }
}
