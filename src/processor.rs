//! Pluggable processing calls.
//!
//! A processor receives one single-rule batch plus the rule's static
//! arguments. Batches can be redelivered after a crash between processing
//! and acknowledgement, so implementations must be idempotent. Any sink a
//! processor writes to is handed to it at construction time.

use crate::error::{ProcessError, RelayError, Result};
use crate::types::RowEvent;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// User-supplied batch processing.
pub trait Processor: Send + Sync {
    fn process(&self, batch: &[RowEvent], arguments: &[String]) -> std::result::Result<(), ProcessError>;
}

impl<F> Processor for F
where
    F: Fn(&[RowEvent], &[String]) -> std::result::Result<(), ProcessError> + Send + Sync,
{
    fn process(&self, batch: &[RowEvent], arguments: &[String]) -> std::result::Result<(), ProcessError> {
        self(batch, arguments)
    }
}

/// Processors keyed by call name.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under `call`, replacing any previous one.
    pub fn register(&mut self, call: impl Into<String>, processor: impl Processor + 'static) -> &mut Self {
        self.processors.insert(call.into(), Arc::new(processor));
        self
    }

    pub fn register_arc(&mut self, call: impl Into<String>, processor: Arc<dyn Processor>) -> &mut Self {
        self.processors.insert(call.into(), processor);
        self
    }

    pub fn contains(&self, call: &str) -> bool {
        self.processors.contains_key(call)
    }

    pub fn get(&self, call: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(call).cloned()
    }

    /// Run `call` on `batch`, turning both errors and panics into
    /// [`RelayError::Processing`].
    pub fn invoke(&self, call: &str, batch: &[RowEvent], arguments: &[String]) -> Result<()> {
        let processor = self
            .get(call)
            .ok_or_else(|| RelayError::UnknownCall(call.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| processor.process(batch, arguments))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Processing {
                call: call.to_string(),
                message: e.to_string(),
            }),
            Err(payload) => Err(RelayError::Processing {
                call: call.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut calls: Vec<_> = self.processors.keys().collect();
        calls.sort();
        f.debug_struct("ProcessorRegistry").field("calls", &calls).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
