use std::fmt;
use std::str::FromStr;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Kind of work a peer proposes at the start of every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "RPC")]
    Rpc,
    FileTransfer,
    Connection,
    Message,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "RPC",
            Self::FileTransfer => "FileTransfer",
            Self::Connection => "Connection",
            Self::Message => "Message",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound request: `(actionType, methodOrDirection, args)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    action: ActionType,
    name: String,
    args: Vec<Value>,
}

impl ActionProposal {
    pub fn new(action: ActionType, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            action,
            name: name.into(),
            args,
        }
    }

    pub fn rpc(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(ActionType::Rpc, method, args)
    }

    pub fn message(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(ActionType::Message, name, args)
    }

    pub fn transfer(direction: TransferDirection) -> Self {
        Self::new(ActionType::FileTransfer, direction.as_str(), Vec::new())
    }

    pub fn connection(event: ConnectionEvent, args: Vec<Value>) -> Self {
        Self::new(ActionType::Connection, event.as_str(), args)
    }

    pub fn action(&self) -> ActionType {
        self.action
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    FromClient,
    ToClient,
    BulkFromClient,
    BulkToClient,
    ListBulk,
}

impl TransferDirection {
    pub const ALL: [TransferDirection; 5] = [
        Self::FromClient,
        Self::ToClient,
        Self::BulkFromClient,
        Self::BulkToClient,
        Self::ListBulk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromClient => "fromClient",
            Self::ToClient => "toClient",
            Self::BulkFromClient => "bulkFromClient",
            Self::BulkToClient => "bulkToClient",
            Self::ListBulk => "listBulk",
        }
    }

    /// Whether bytes flow from the client to the service.
    pub fn server_receives(self) -> bool {
        matches!(self, Self::FromClient | Self::BulkFromClient)
    }

    pub fn is_bulk(self) -> bool {
        matches!(self, Self::BulkFromClient | Self::BulkToClient | Self::ListBulk)
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Peers historically capitalise the first letter.
        Self::ALL
            .into_iter()
            .find(|direction| direction.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

/// Sent by the client right after a `FileTransfer` proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub file_id: Value,
    pub token: String,
    /// Total payload size the sender promises, when known.
    pub size: Option<u64>,
    /// Hex SHA-256 of the payload, when known.
    pub digest: Option<String>,
}

impl TransferDescriptor {
    pub fn new(file_id: impl Into<Value>, token: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            token: token.into(),
            size: None,
            digest: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    New,
    Connected,
    Drop,
}

impl ConnectionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connected => "connected",
            Self::Drop => "drop",
        }
    }
}

impl FromStr for ConnectionEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "connected" => Ok(Self::Connected),
            "drop" => Ok(Self::Drop),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_parse_case_insensitively() {
        assert_eq!("FromClient".parse(), Ok(TransferDirection::FromClient));
        assert_eq!("listBulk".parse(), Ok(TransferDirection::ListBulk));
        assert_eq!("sideways".parse::<TransferDirection>(), Err("sideways".to_string()));
    }

    #[test]
    fn only_uploads_flow_to_the_server() {
        let receiving: Vec<_> = TransferDirection::ALL
            .into_iter()
            .filter(|direction| direction.server_receives())
            .collect();
        assert_eq!(
            receiving,
            vec![TransferDirection::FromClient, TransferDirection::BulkFromClient]
        );
    }

    #[test]
    fn proposal_survives_the_wire_codec() {
        let proposal = ActionProposal::rpc("echo", vec![Value::from("hello")]);
        let bytes = crate::codec::encode(&proposal).unwrap();
        let decoded: ActionProposal = crate::codec::decode(&bytes).unwrap();
        assert_eq!(decoded, proposal);
        assert_eq!(decoded.action(), ActionType::Rpc);
    }
}
