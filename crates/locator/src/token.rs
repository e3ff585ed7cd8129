// Discovery token and the wire message that carries it between peers

use crate::{LocatorError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Version of the token exchange payload
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on an encoded token; anything larger is rejected unread
const MAX_TOKEN_BYTES: usize = 1024;

/// Opaque credential identifying a device to the ranging subsystem
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryToken(Vec<u8>);

impl DiscoveryToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(LocatorError::TokenDeserialization("token is empty".to_string()));
        }
        if bytes.len() > MAX_TOKEN_BYTES {
            return Err(LocatorError::TokenDeserialization(format!(
                "token is {} bytes, limit is {}",
                bytes.len(),
                MAX_TOKEN_BYTES
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short printable prefix, safe to log
    pub fn fingerprint(&self) -> String {
        bs58::encode(&self.0).into_string().chars().take(8).collect()
    }
}

impl fmt::Debug for DiscoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryToken({}…)", self.fingerprint())
    }
}

impl Serialize for DiscoveryToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&bs58::encode(&self.0).into_string())
    }
}

impl<'de> Deserialize<'de> for DiscoveryToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = bs58::decode(&encoded)
            .into_vec()
            .map_err(serde::de::Error::custom)?;
        DiscoveryToken::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}

/// Messages exchanged over an established transport link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    DiscoveryToken { version: u8, token: DiscoveryToken },
}

/// Serialize the local token for transmission
pub fn encode_token(token: &DiscoveryToken) -> Result<Vec<u8>> {
    let message = PeerMessage::DiscoveryToken {
        version: WIRE_VERSION,
        token: token.clone(),
    };
    Ok(serde_json::to_vec(&message)?)
}

/// Parse a payload received from a peer into its discovery token
pub fn decode_token(payload: &[u8]) -> Result<DiscoveryToken> {
    let message: PeerMessage = serde_json::from_slice(payload)
        .map_err(|e| LocatorError::TokenDeserialization(e.to_string()))?;

    match message {
        PeerMessage::DiscoveryToken { version, token } => {
            if version != WIRE_VERSION {
                return Err(LocatorError::ProtocolVersion {
                    expected: WIRE_VERSION,
                    found: version,
                });
            }
            Ok(token)
        }
    }
}
