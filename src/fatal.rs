//! Process-level sink for unclassified channel faults.
//!
//! An unexpected channel `error` notification means the broker session
//! broke an invariant this layer cannot recover from. Such faults are never
//! swallowed or retried: they bypass the normal error-return path and reach
//! a global handler, which by default logs the fault and aborts the
//! process.

use std::sync::RwLock;

use tracing::error;

use crate::transport::Fault;

type Handler = Box<dyn Fn(Fault) + Send + Sync>;

static HANDLER: RwLock<Option<Handler>> = RwLock::new(None);

/// Install a global handler for unrecoverable channel faults, replacing the
/// default log-and-abort behavior. Intended for hosts that route fatal
/// faults into their own shutdown machinery.
pub fn set_fatal_fault_handler(handler: impl Fn(Fault) + Send + Sync + 'static) {
    if let Ok(mut slot) = HANDLER.write() {
        *slot = Some(Box::new(handler));
    }
}

pub(crate) fn report(fault: Fault) {
    if let Ok(slot) = HANDLER.read() {
        if let Some(handler) = slot.as_ref() {
            handler(fault);
            return;
        }
    }
    error!(code = ?fault.code, message = %fault.message, "unrecoverable channel fault");
    std::process::abort();
}
