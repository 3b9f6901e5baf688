//! Registry of user-defined pure functions referenced by Function key-values.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::kv::Deadline;
use crate::Error;

/// What a registered function decided for the key it was applied to.
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionOutput {
    /// Identity: keep the current state.
    Nothing,
    /// Remove the key.
    Remove,
    /// Replace the current value.
    Update(Option<Vec<u8>>),
    /// Keep the value but expire it at the deadline.
    Expire(Deadline),
}

/// A registered pure function. Must be deterministic: the same inputs are
/// replayed during compaction and must produce the same output.
pub trait SegmentFunction: Send + Sync {
    fn apply(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        deadline: Option<Deadline>,
    ) -> FunctionOutput;
}

impl<F> SegmentFunction for F
where
    F: Fn(&[u8], Option<&[u8]>, Option<Deadline>) -> FunctionOutput + Send + Sync,
{
    fn apply(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        deadline: Option<Deadline>,
    ) -> FunctionOutput {
        self(key, value, deadline)
    }
}

/// Maps function ids to their implementations.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<Vec<u8>, Arc<dyn SegmentFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<Vec<u8>>,
        function: impl SegmentFunction + 'static,
    ) -> &mut Self {
        self.functions.insert(id.into(), Arc::new(function));
        self
    }

    /// Looks up a function, failing with [`Error::NoFunction`] on an unknown
    /// id. Missing functions surface at merge time, unchanged, to the caller.
    pub fn get(&self, id: &[u8]) -> Result<Arc<dyn SegmentFunction>> {
        self.functions.get(id).cloned().ok_or_else(|| {
            Error::NoFunction(String::from_utf8_lossy(id).into_owned())
        })
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.len())
            .finish()
    }
}
