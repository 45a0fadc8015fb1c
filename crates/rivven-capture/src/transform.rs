//! # Record transformations
//!
//! Per-record event shaping applied by the delivery engine before a record
//! reaches the consumer.
//!
//! | Transform | Description |
//! |-----------|-------------|
//! | `MaskField` | Mask sensitive fields in `before` / `after` |
//! | `RegexRouter` | Rewrite the destination from `db.table` patterns |
//! | `FnTransform` | Wrap a closure |
//!
//! ```rust,ignore
//! let chain = TransformChain::new()
//!     .add(MaskField::new(["ssn"]))
//!     .add(RegexRouter::new().route(r"^inventory\..*", "inventory-events")?);
//! let shaped = chain.apply(event)?;
//! ```

use crate::error::{CaptureError, Result};
use crate::event::ChangeEvent;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// A single record transformation.
pub trait Transformation: Send + Sync {
    /// Transform an event. `Ok(None)` drops the record from delivery.
    fn apply(&self, event: ChangeEvent) -> Result<Option<ChangeEvent>>;

    fn name(&self) -> &'static str;
}

/// Transformations applied in sequence.
#[derive(Clone, Default)]
pub struct TransformChain {
    transforms: Vec<Arc<dyn Transformation>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transform to the chain (builder pattern).
    #[allow(clippy::should_implement_trait)]
    pub fn add<T: Transformation + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    pub fn add_shared(mut self, transform: Arc<dyn Transformation>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Apply all transforms in sequence, stopping at the first that drops
    /// the record. Errors name the failing transform.
    pub fn apply(&self, mut event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        for transform in &self.transforms {
            event = match transform.apply(event) {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(None),
                Err(CaptureError::Transform(msg)) => {
                    return Err(CaptureError::transform(format!("{}: {}", transform.name(), msg)))
                }
                Err(e) => return Err(e),
            };
        }
        Ok(Some(event))
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }
}

/// Closure-backed transformation.
pub struct FnTransform<F> {
    name: &'static str,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(ChangeEvent) -> Result<Option<ChangeEvent>> + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> Transformation for FnTransform<F>
where
    F: Fn(ChangeEvent) -> Result<Option<ChangeEvent>> + Send + Sync,
{
    fn apply(&self, event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        (self.f)(event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Masking strategy for sensitive fields.
#[derive(Debug, Clone, Default)]
pub enum MaskStrategy {
    /// Replace with a fixed string
    Fixed(String),
    /// Replace with asterisks, keeping length (up to 20)
    #[default]
    Asterisks,
    /// Replace with null
    Null,
    /// Remove the field
    Redact,
}

/// Mask sensitive fields in row images.
#[derive(Debug, Clone)]
pub struct MaskField {
    fields: HashSet<String>,
    strategy: MaskStrategy,
}

impl MaskField {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            strategy: MaskStrategy::Asterisks,
        }
    }

    pub fn with_strategy(mut self, strategy: MaskStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn mask_value(&self, value: &Value) -> Value {
        match &self.strategy {
            MaskStrategy::Fixed(s) => Value::String(s.clone()),
            MaskStrategy::Asterisks => match value.as_str() {
                Some(s) => Value::String("*".repeat(s.chars().count().min(20))),
                None => Value::String("****".to_string()),
            },
            MaskStrategy::Null | MaskStrategy::Redact => Value::Null,
        }
    }

    fn mask_object(&self, obj: &mut Map<String, Value>) {
        for field in &self.fields {
            if matches!(self.strategy, MaskStrategy::Redact) {
                obj.remove(field);
            } else if let Some(value) = obj.get_mut(field) {
                *value = self.mask_value(value);
            }
        }
    }
}

impl Transformation for MaskField {
    fn apply(&self, mut event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        for image in [event.before.as_mut(), event.after.as_mut()].into_iter().flatten() {
            if let Some(obj) = image.as_object_mut() {
                self.mask_object(obj);
            }
        }
        Ok(Some(event))
    }

    fn name(&self) -> &'static str {
        "MaskField"
    }
}

/// Route records to a different destination based on `db.table`.
///
/// The first matching rule wins; unmatched records keep their destination.
#[derive(Debug, Clone, Default)]
pub struct RegexRouter {
    rules: Vec<(Regex, String)>,
}

impl RegexRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a routing rule.
    pub fn route(mut self, pattern: &str, destination: impl Into<String>) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| CaptureError::config(format!("invalid route pattern '{}': {}", pattern, e)))?;
        self.rules.push((re, destination.into()));
        Ok(self)
    }

    pub fn destination_for(&self, table: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(table))
            .map(|(_, destination)| destination.as_str())
    }
}

impl Transformation for RegexRouter {
    fn apply(&self, mut event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        if let Some(destination) = self.destination_for(&event.table.to_string()) {
            event.destination = destination.to_string();
        }
        Ok(Some(event))
    }

    fn name(&self) -> &'static str {
        "RegexRouter"
    }
}
