//! Message dispatch and request handling.
//!
//! Pure logic, no I/O. Each handler takes a mutable reference to
//! [`ManagerState`] and returns the frames to send back on the
//! requesting connection, in order.

use std::collections::BTreeSet;

use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Status, error_code};
use crate::resource::ResourceType;

use super::state::{ConnectionId, ManagerState, UpdateOutcome};

/// Dispatch a request message to the appropriate handler.
///
/// Manager-originated variants sent by a client are answered with
/// `unknown_type`.
pub fn handle_message(
    state: &mut ManagerState,
    request: Message,
    connection_id: ConnectionId,
) -> Vec<Message> {
    match request {
        Message::Hello {
            id,
            version,
            set_id,
            application_class,
            auto_release,
            always_reply,
        } => {
            // Both flags are recorded only: every request gets a reply
            // and a lost grant is never re-granted unprompted.
            tracing::debug!(?connection_id, set_id, auto_release, always_reply, "hello");
            vec![handle_hello(
                state,
                id,
                version,
                set_id,
                application_class,
                connection_id,
            )]
        }
        Message::Acquire {
            id,
            set_id,
            application_class,
            resources,
        } => {
            tracing::debug!(
                ?connection_id,
                set_id,
                class = %application_class,
                count = resources.len(),
                "acquire"
            );
            match state.acquire(connection_id, set_id, &resources) {
                Ok(Some(grant)) => vec![granted(id, set_id, grant)],
                Ok(None) => vec![Message::Denied { id, set_id }],
                Err(reason) => vec![error(id, error_code::NOT_REGISTERED, reason)],
            }
        }
        Message::Release { id, set_id } => match state.release(connection_id, set_id) {
            Ok(()) => vec![Message::Released { id, set_id }],
            Err(reason) => vec![error(id, error_code::NOT_REGISTERED, reason)],
        },
        Message::Update {
            id,
            set_id,
            resources,
        } => match state.update(connection_id, set_id, &resources) {
            Ok(outcome) => {
                let mut out = vec![Message::UpdateOk { id, set_id }];
                match outcome {
                    UpdateOutcome::Unchanged => {}
                    UpdateOutcome::Regranted(grant) => out.push(granted(0, set_id, grant)),
                    UpdateOutcome::Lost => out.push(Message::Lost { id: 0, set_id }),
                }
                out
            }
            Err(reason) => vec![error(id, error_code::NOT_REGISTERED, reason)],
        },
        // Manager-originated messages should never be sent by clients.
        Message::HelloAck { id, .. }
        | Message::Granted { id, .. }
        | Message::Denied { id, .. }
        | Message::Released { id, .. }
        | Message::Lost { id, .. }
        | Message::ReleasedByManager { id, .. }
        | Message::Available { id, .. }
        | Message::UpdateOk { id, .. }
        | Message::Error { id, .. } => vec![error(
            id,
            error_code::UNKNOWN_TYPE,
            "message type not accepted by the manager",
        )],
    }
}

// -- Individual handlers --

fn handle_hello(
    state: &mut ManagerState,
    id: u32,
    version: u32,
    set_id: u32,
    application_class: String,
    connection_id: ConnectionId,
) -> Message {
    if state.is_registered(connection_id) {
        return error(id, error_code::INVALID_HELLO, "already registered");
    }
    if id != 0 {
        return hello_error("invalid_hello");
    }
    if version != PROTOCOL_VERSION {
        return hello_error("version_mismatch");
    }
    match state.register(connection_id, set_id, application_class) {
        Ok(()) => Message::HelloAck {
            id: 0,
            status: Status::Ok,
            error: None,
        },
        Err(_) => hello_error("invalid_hello"),
    }
}

// -- Helpers --

fn granted(id: u32, set_id: u32, grant: BTreeSet<ResourceType>) -> Message {
    Message::Granted {
        id,
        set_id,
        resources: grant.into_iter().collect(),
    }
}

fn hello_error(reason: &str) -> Message {
    Message::HelloAck {
        id: 0,
        status: Status::Error,
        error: Some(reason.into()),
    }
}

pub(super) fn error(id: u32, code: u32, message: &str) -> Message {
    Message::Error {
        id,
        code,
        message: message.into(),
    }
}
