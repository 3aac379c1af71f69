//! IPC codec and wire protocol: MessagePack framing shared by the
//! client transport and the development manager.

pub mod codec;
pub mod protocol;
