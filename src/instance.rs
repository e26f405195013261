//! Process-wide [`Correlator`] handle.
//!
//! Library code receives its correlator explicitly. This accessor exists for
//! the composition root only, where outer layers that cannot be handed a
//! reference need to reach the one started at boot.

use std::sync::{PoisonError, RwLock};

use tracing_error::SpanTrace;

use crate::Correlator;

static INSTANCE: RwLock<Option<Correlator>> = RwLock::new(None);

/// Install `correlator` as the process-wide instance, replacing any previous one.
pub fn set_instance(correlator: Correlator) {
    let previous = INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(correlator);
    if previous.is_some() {
        tracing::warn!("Replacing the process-wide correlator");
    }
}

/// The process-wide instance installed by [`set_instance`].
pub fn instance() -> Result<Correlator, InstanceError> {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(InstanceError::unset)
}

/// Error returned by [`instance`] before any instance is installed.
#[derive(Debug)]
pub struct InstanceError {
    context: SpanTrace,
}

impl InstanceError {
    fn unset() -> Self {
        Self {
            context: SpanTrace::capture(),
        }
    }
}

impl std::fmt::Display for InstanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "No correlator instance has been set")?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InstanceError {}
