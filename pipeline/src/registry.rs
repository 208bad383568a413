//! Stream registry for TULVA
//!
//! Holds every registered [`StreamDescriptor`] keyed by name. Descriptors are
//! validated on the way in and handed out as `Arc`s so running supervisors
//! never observe a change.

use crate::descriptor::StreamDescriptor;
use crate::error::{PipelineError, Result};
use crate::point::DataType;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Registry of stream descriptors
///
/// Not internally synchronized; the pipeline wraps it in a lock.
#[derive(Default)]
pub struct StreamRegistry {
    streams: BTreeMap<String, Arc<StreamDescriptor>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a descriptor
    ///
    /// # Errors
    /// `InvalidDescriptor` when validation fails, `DuplicateStream` when the
    /// name is taken
    pub fn register(&mut self, descriptor: StreamDescriptor) -> Result<Arc<StreamDescriptor>> {
        descriptor.validate()?;

        if self.streams.contains_key(&descriptor.name) {
            return Err(PipelineError::DuplicateStream(descriptor.name));
        }

        info!(
            stream = %descriptor.name,
            data_type = %descriptor.data_type,
            transport = %descriptor.transport,
            priority = %descriptor.priority,
            parser = descriptor.parser.name(),
            symbols = descriptor.symbols.len(),
            active = descriptor.active,
            "Registered stream"
        );

        let descriptor = Arc::new(descriptor);
        self.streams
            .insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Remove a descriptor by name
    pub fn deregister(&mut self, name: &str) -> Result<Arc<StreamDescriptor>> {
        let removed = self
            .streams
            .remove(name)
            .ok_or_else(|| PipelineError::UnknownStream(name.to_string()))?;
        info!(stream = %name, "Deregistered stream");
        Ok(removed)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<StreamDescriptor>> {
        self.streams.get(name).cloned()
    }

    /// Descriptors marked active, in name order
    pub fn list_active(&self) -> Vec<Arc<StreamDescriptor>> {
        self.streams.values().filter(|d| d.active).cloned().collect()
    }

    /// Descriptors carrying a given data type
    pub fn by_data_type(&self, data_type: DataType) -> Vec<Arc<StreamDescriptor>> {
        self.streams
            .values()
            .filter(|d| d.data_type == data_type)
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
