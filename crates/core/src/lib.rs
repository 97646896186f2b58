//! Core wire-protocol types for the Crewline realtime gateway.

pub mod message;
pub mod protocol;

pub use message::{DeliveryStatus, PresenceStatus, QueueStatus};
pub use protocol::{
    decode_client_frame, ClientCommand, ConversationRef, InboundFrame, MessageBroadcast,
    MessageRef, ProtocolError, ScheduledBroadcast, SendMessage, ServerFrame,
};
