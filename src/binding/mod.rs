//! Message binding core
//!
//! Transports expose inbound units as [`Message`]s and accept outbound
//! events through [`StructuredWriter`] / [`BinaryWriter`]. The [`write`]
//! pipeline connects the two, applying [`TransformerFactory`] changes
//! along the way.

mod buffering;
mod event_message;
mod message;
mod options;
mod to_event;
mod transformer;
mod write;

pub use buffering::{buffer_message, copy_message, with_acks_before_finish, AcksBeforeFinish, BufferedMessage};
pub use event_message::{write_event_binary, EventMessage};
pub use message::{BinaryWriter, BoxMessage, Encoding, Finisher, Message, StructuredWriter};
pub use options::PipelineOptions;
pub use to_event::{to_event, EventBuilder};
pub use transformer::{
    AddAttribute, AddExtension, DeleteAttribute, DeleteExtension, EventTransformer,
    TransformerFactory, UpdateAttribute, UpdateExtension, UpdateFn, Version,
};
pub use write::write;
