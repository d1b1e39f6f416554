//! Staged connection metadata.
//!
//! A connection's record grows as it moves through the gateway:
//!
//! | Stage                               | Adds                                |
//! |-------------------------------------|-------------------------------------|
//! | [`ConnectionMetadata`]              | remote address, connection ID, maps |
//! | [`ConnectionAuthPendingMetadata`]   | client version, login username      |
//! | [`ConnectionAuthenticatedMetadata`] | authenticated username              |
//! | [`ChannelMetadata`]                 | channel ID                          |
//!
//! Each stage owns its predecessor by value and is produced by a consuming
//! transition, so a record can never move backwards. The wire format is
//! flat JSON: embedded stages are flattened into the outer object.
//!
//! The `metadata`, `environment` and `files` maps are `Option`s. An absent
//! map is omitted from JSON and is left alone by [`ConnectionMetadata::merge`];
//! a present map, even an empty one, replaces the receiver's map wholesale.

mod address;

pub use address::RemoteAddress;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A string value with a sensitivity flag.
///
/// `sensitive` marks data that should not be sent to external servers
/// unnecessarily. Nothing in this crate enforces it; serializers that talk to
/// the outside world are expected to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub value: String,
    #[serde(default)]
    pub sensitive: bool,
}

impl Value {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            sensitive: true,
        }
    }
}

/// A binary value with a sensitivity flag. Base64 on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryValue {
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub sensitive: bool,
}

impl BinaryValue {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            sensitive: false,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// SSH authentication methods a connection may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

/// Metadata for an inbound connection before any authentication attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub remote_address: RemoteAddress,
    /// Opaque identifier of the SSH connection.
    pub connection_id: String,
    /// Methods the client may authenticate with. Internal only.
    #[serde(skip)]
    pub authentication_methods: BTreeSet<AuthMethod>,
    /// Key-value pairs from the auth/config system that backends may expose as
    /// labels, environment variables and the like.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// Environment variables for the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, Value>>,
    /// File name to content, placed by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<HashMap<String, BinaryValue>>,
}

impl ConnectionMetadata {
    /// A fresh record for a just-accepted connection, with no maps allocated.
    pub fn new(remote_address: RemoteAddress, connection_id: impl Into<String>) -> Self {
        Self {
            remote_address,
            connection_id: connection_id.into(),
            ..Default::default()
        }
    }

    /// A record useful for tests: 127.0.0.1:22 with empty (allocated) maps.
    pub fn for_test() -> Self {
        Self {
            remote_address: RemoteAddress::new([127, 0, 0, 1].into(), 22),
            connection_id: "0123456789ABCDEF".to_string(),
            authentication_methods: BTreeSet::new(),
            metadata: Some(HashMap::new()),
            environment: Some(HashMap::new()),
            files: Some(HashMap::new()),
        }
    }

    /// The client has announced a username; authentication is now pending.
    pub fn start_authentication(
        self,
        client_version: impl Into<String>,
        username: impl Into<String>,
    ) -> ConnectionAuthPendingMetadata {
        ConnectionAuthPendingMetadata {
            connection: self,
            client_version: client_version.into(),
            username: username.into(),
        }
    }

    /// Override maps present in `other`; absent maps keep the current value.
    pub fn merge(&mut self, other: ConnectionMetadata) {
        if let Some(metadata) = other.metadata {
            self.metadata = Some(metadata);
        }
        if let Some(files) = other.files {
            self.files = Some(files);
        }
        if let Some(environment) = other.environment {
            self.environment = Some(environment);
        }
    }

    /// Editable metadata map, allocated on first access.
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, Value> {
        self.metadata.get_or_insert_with(HashMap::new)
    }

    /// Editable environment map, allocated on first access.
    pub fn environment_mut(&mut self) -> &mut HashMap<String, Value> {
        self.environment.get_or_insert_with(HashMap::new)
    }

    /// Editable files map, allocated on first access.
    pub fn files_mut(&mut self) -> &mut HashMap<String, BinaryValue> {
        self.files.get_or_insert_with(HashMap::new)
    }
}

/// Editable metadata map of a record that may not exist.
///
/// A missing record yields `None` and nothing is allocated.
pub fn metadata_of(meta: Option<&mut ConnectionMetadata>) -> Option<&mut HashMap<String, Value>> {
    meta.map(ConnectionMetadata::metadata_mut)
}

/// Editable environment map of a record that may not exist.
pub fn environment_of(
    meta: Option<&mut ConnectionMetadata>,
) -> Option<&mut HashMap<String, Value>> {
    meta.map(ConnectionMetadata::environment_mut)
}

/// Editable files map of a record that may not exist.
pub fn files_of(
    meta: Option<&mut ConnectionMetadata>,
) -> Option<&mut HashMap<String, BinaryValue>> {
    meta.map(ConnectionMetadata::files_mut)
}

/// A connection whose client has provided a username but is not yet authenticated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAuthPendingMetadata {
    #[serde(flatten)]
    pub connection: ConnectionMetadata,
    /// Version string sent by the client. Empty if none was sent.
    #[serde(default)]
    pub client_version: String,
    /// Username given on login. Not necessarily the authenticated one.
    #[serde(default)]
    pub username: String,
}

impl ConnectionAuthPendingMetadata {
    pub fn for_test(username: impl Into<String>) -> Self {
        ConnectionMetadata::for_test().start_authentication("SSH-2.0-FooSSH", username)
    }

    pub fn connection(&self) -> &ConnectionMetadata {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionMetadata {
        &mut self.connection
    }

    /// Authentication succeeded as `username`.
    pub fn authenticated(self, username: impl Into<String>) -> ConnectionAuthenticatedMetadata {
        ConnectionAuthenticatedMetadata {
            pending: self,
            authenticated_username: username.into(),
        }
    }

    /// Authentication failed; the authenticated username stays empty.
    pub fn auth_failed(self) -> ConnectionAuthenticatedMetadata {
        ConnectionAuthenticatedMetadata {
            pending: self,
            authenticated_username: String::new(),
        }
    }
}

/// A connection past the authentication decision point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAuthenticatedMetadata {
    #[serde(flatten)]
    pub pending: ConnectionAuthPendingMetadata,
    /// Username actually verified by the auth system. May differ from the
    /// login username (OAuth2, Kerberos). Empty means not authenticated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authenticated_username: String,
}

impl ConnectionAuthenticatedMetadata {
    pub fn pending(&self) -> &ConnectionAuthPendingMetadata {
        &self.pending
    }

    pub fn connection(&self) -> &ConnectionMetadata {
        &self.pending.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionMetadata {
        &mut self.pending.connection
    }

    pub fn is_authenticated(&self) -> bool {
        !self.authenticated_username.is_empty()
    }

    /// Apply overrides from a later auth/authz stage in place.
    ///
    /// Present maps replace the whole map (no per-key union) and a non-empty
    /// authenticated username replaces the current one. Clone first to keep
    /// the pre-merge record.
    pub fn merge(&mut self, other: ConnectionAuthenticatedMetadata) -> &mut Self {
        let ConnectionAuthenticatedMetadata {
            pending,
            authenticated_username,
        } = other;
        self.pending.connection.merge(pending.connection);
        if !authenticated_username.is_empty() {
            self.authenticated_username = authenticated_username;
        }
        self
    }

    /// A new channel was opened on this connection.
    pub fn channel(self, channel_id: u64) -> ChannelMetadata {
        ChannelMetadata {
            connection: self,
            channel_id,
        }
    }
}

/// Metadata of one channel on an authenticated connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    #[serde(flatten)]
    pub connection: ConnectionAuthenticatedMetadata,
    #[serde(rename = "channelID")]
    pub channel_id: u64,
}

impl ChannelMetadata {
    pub fn authenticated(&self) -> &ConnectionAuthenticatedMetadata {
        &self.connection
    }
}
