//! Distributed tracing extension
//!
//! Carries a W3C trace context through events as the `traceparent` and
//! `tracestate` extensions, so a consumer can continue the producer's trace.

use crate::binding::{AddExtension, BinaryWriter, EventTransformer, TransformerFactory};
use crate::error::Result;
use crate::event::Event;
use crate::types::Value;
use serde::{Deserialize, Serialize};

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// W3C trace context carried as event extensions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedTracingExtension {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl DistributedTracingExtension {
    pub fn new(traceparent: impl Into<String>) -> Self {
        Self {
            traceparent: traceparent.into(),
            tracestate: None,
        }
    }

    pub fn with_tracestate(mut self, tracestate: impl Into<String>) -> Self {
        self.tracestate = Some(tracestate.into());
        self
    }

    /// Read the trace context from an event; `None` without a `traceparent`
    pub fn from_event(event: &Event) -> Option<Self> {
        let traceparent = event.extension(TRACEPARENT)?.to_canonical();
        let tracestate = event.extension(TRACESTATE).map(Value::to_canonical);
        Some(Self {
            traceparent,
            tracestate,
        })
    }

    /// Write both extensions, replacing any already present
    pub fn write_to(&self, event: &mut Event) -> Result<()> {
        event.set_extension(TRACEPARENT, self.traceparent.as_str())?;
        match &self.tracestate {
            Some(state) => event.set_extension(TRACESTATE, state.as_str())?,
            None => {
                event.remove_extension(TRACESTATE);
            }
        }
        Ok(())
    }

    fn additions(&self) -> Vec<AddExtension> {
        let mut out = vec![AddExtension::new(
            TRACEPARENT,
            Value::String(self.traceparent.clone()),
        )];
        if let Some(state) = &self.tracestate {
            out.push(AddExtension::new(TRACESTATE, Value::String(state.clone())));
        }
        out
    }
}

/// Adds the trace context to outgoing events that do not carry one
impl TransformerFactory for DistributedTracingExtension {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        let mut writer = writer;
        for add in self.additions().iter().rev() {
            writer = add.binary_transformer(writer)?;
        }
        Some(writer)
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            if event.extension(TRACEPARENT).is_none() {
                event.set_extension(TRACEPARENT, self.traceparent.as_str())?;
            }
            if let (Some(state), None) = (&self.tracestate, event.extension(TRACESTATE)) {
                event.set_extension(TRACESTATE, state.as_str())?;
            }
            Ok(())
        }))
    }
}
