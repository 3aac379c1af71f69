//! Wire protocol message types for resource manager IPC.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and
//! `id` fields. Id 0 is reserved for the handshake and for notifications
//! the manager sends unsolicited.

use serde::{Deserialize, Serialize};

use crate::resource::{Resource, ResourceType, StreamTag};

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    #[serde(rename = "hello")]
    Hello {
        id: u32,
        version: u32,
        set_id: u32,
        application_class: String,
        auto_release: bool,
        always_reply: bool,
    },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Requests (client → manager) --
    #[serde(rename = "acquire")]
    Acquire {
        id: u32,
        set_id: u32,
        application_class: String,
        resources: Vec<ResourceDescriptor>,
    },

    #[serde(rename = "release")]
    Release { id: u32, set_id: u32 },

    #[serde(rename = "update")]
    Update {
        id: u32,
        set_id: u32,
        resources: Vec<ResourceDescriptor>,
    },

    // -- Notifications (manager → client) --
    #[serde(rename = "granted")]
    Granted {
        id: u32,
        set_id: u32,
        resources: Vec<ResourceType>,
    },

    #[serde(rename = "denied")]
    Denied { id: u32, set_id: u32 },

    #[serde(rename = "released")]
    Released { id: u32, set_id: u32 },

    #[serde(rename = "lost")]
    Lost { id: u32, set_id: u32 },

    #[serde(rename = "released_by_manager")]
    ReleasedByManager { id: u32, set_id: u32 },

    #[serde(rename = "available")]
    Available {
        id: u32,
        set_id: u32,
        resources: Vec<ResourceType>,
    },

    #[serde(rename = "update_ok")]
    UpdateOk { id: u32, set_id: u32 },

    #[serde(rename = "error")]
    Error { id: u32, code: u32, message: String },
}

/// Handshake status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// One requested resource as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceType,
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_tag: Option<StreamTag>,
}

impl From<&Resource> for ResourceDescriptor {
    fn from(resource: &Resource) -> Self {
        let audio = resource.audio();
        Self {
            kind: resource.kind(),
            optional: resource.is_optional(),
            audio_group: audio.and_then(|a| a.audio_group()).map(str::to_string),
            process_id: resource.process_id(),
            stream_tag: audio.and_then(|a| a.stream_tag()).cloned(),
        }
    }
}

/// Machine-readable error codes carried by [`Message::Error`].
pub mod error_code {
    pub const UNKNOWN_TYPE: u32 = 1;
    pub const NOT_REGISTERED: u32 = 2;
    pub const VERSION_MISMATCH: u32 = 3;
    pub const MALFORMED: u32 = 4;
    pub const INVALID_HELLO: u32 = 5;
}

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used by the manager as a fallback when [`Message`] deserialization
/// fails, so the request `id` can be echoed in the error reply.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u32,
}
