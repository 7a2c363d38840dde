use crate::events::*;

/// Host-side event surface. The core never talks to the UI directly; the
/// embedding application implements this and bridges to its own event bus.
pub trait RecorderRuntime: Send + Sync + 'static {
    fn emit_lifecycle(&self, event: SessionLifecycleEvent);
    fn emit_data(&self, event: SessionDataEvent);
    fn emit_error(&self, event: SessionErrorEvent);
}
