//! # a3s-cloudevents
//!
//! CloudEvents message bindings for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-cloudevents` moves CloudEvents between transports without forcing
//! every hop through a parsed event. A message arriving in structured mode
//! can be forwarded byte-for-byte; a binary-mode message can be re-emitted
//! as headers without decoding its payload. Only when the source and target
//! modes disagree is the event materialised in memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_cloudevents::binding::{to_event, PipelineOptions};
//! use a3s_cloudevents::protocol::http::{write_request, HttpMessage};
//! use a3s_cloudevents::binding::EventMessage;
//! use a3s_cloudevents::Event;
//! use bytes::Bytes;
//!
//! # fn example() -> a3s_cloudevents::Result<()> {
//! let mut event = Event::new();
//! event.set_id("ABC-123");
//! event.set_type("com.example.test");
//! event.set_source("/unit/test/client");
//! event.set_data("application/json", &serde_json::json!({"sq": 42}))?;
//!
//! // Binary mode: attributes become `ce-` headers
//! let mut request = http::Request::new(Bytes::new());
//! write_request(&mut EventMessage::new(event.clone()), &mut request, &[], &PipelineOptions::default())?;
//! assert_eq!(request.headers()["ce-id"], "ABC-123");
//!
//! // And back again
//! let mut inbound = HttpMessage::from_request(request);
//! assert_eq!(to_event(&mut inbound)?, event);
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **http**: `reqwest` client (sender, requester) and `hyper` server
//!   (receiver, responder)
//! - **kafka**: record headers, with the `key` extension mapped to the record key
//! - **amqp**: typed application properties; requester over reply-to
//! - **nats**: structured mode only
//! - **pubsub**: message attributes
//! - **memory**: in-process channel
//!
//! ## Architecture
//!
//! - **Message**: a readable inbound unit in structured, binary or event form
//! - **StructuredWriter / BinaryWriter**: targets the pipeline writes into
//! - **write**: the pipeline, with transformers and event-form fallback
//! - **Sender / Receiver / Requester / Responder**: transport roles
//! - **Client**: event-level facade with defaulters and a handler loop

pub mod binding;
pub mod client;
pub mod error;
pub mod event;
pub mod extensions;
pub mod format;
pub mod protocol;
pub mod types;
pub mod version;

// Re-export core types
pub use binding::{
    to_event, write, BinaryWriter, BoxMessage, Encoding, EventMessage, Message, PipelineOptions,
    StructuredWriter, TransformerFactory,
};
pub use client::{handler_fn, Client, EventHandler, Inbound};
pub use error::{CloudEventError, Result, ValidationError};
pub use event::Event;
pub use extensions::DistributedTracingExtension;
pub use format::Format;
pub use protocol::{Context, Receiver, Requester, Responder, ResponseFn, Sender};
pub use types::{Uri, UriRef, Value};
pub use version::{Attribute, AttributeKind, SpecVersion};
