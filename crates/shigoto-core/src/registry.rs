//! Registration table mapping job type names to handlers.
//!
//! Built once at startup from configuration; the worker treats it as an
//! injected lookup table. A type name with no handler is a wiring defect,
//! so lookups that miss abort processing instead of failing the job.

use std::collections::HashMap;

use crate::JobHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for jobs of type `job_type`, replacing any previous
    /// registration for that name.
    pub fn register(
        mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        self.handlers.insert(job_type.into(), Box::new(handler));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&dyn JobHandler> {
        self.handlers.get(job_type).map(|handler| handler.as_ref())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
