//! The interpreter seam.
//!
//! Recipes are evaluated by an embedded scripting runtime that this
//! crate treats as a black box: it registers resources through the host
//! ABI and hands back opaque handles to guard predicates and block
//! bodies. The engine re-enters the interpreter through [`Interpreter`],
//! always on the main thread and never from a worker.
//!
//! Handles reference interpreter-heap objects that its garbage
//! collector would otherwise be free to reclaim mid-run, so every
//! handle stored in a record is wrapped in a [`PinnedCallable`]: pinned
//! at registration, unpinned when the record is torn down.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Opaque reference to a callable living in the interpreter's heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallableHandle(pub u64);

impl fmt::Display for CallableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callable#{}", self.0)
    }
}

/// Failures crossing the interpreter boundary.
#[derive(Debug, Error)]
pub enum InterpreterError {
    /// The scripted code raised; the message is what it raised with.
    #[error("script raised: {0}")]
    Raised(String),
    /// The handle no longer resolves to a live object. Fatal: pinning
    /// should make this impossible.
    #[error("callable handle lost: {0}")]
    HandleLost(CallableHandle),
    /// Allocation failure or other host-side fault. Fatal.
    #[error("interpreter host error: {0}")]
    Host(String),
}

impl InterpreterError {
    /// Whether the scheduler must abort the run (host/FFI fault) rather
    /// than treat this as a per-resource failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, InterpreterError::Raised(_))
    }
}

/// The embedded scripting runtime, as seen from the native side.
///
/// Implementations must only be *called* from the main thread; the
/// trait is `Send + Sync` so handles can ride inside records that cross
/// into worker threads, not so workers may call back in.
pub trait Interpreter: Send + Sync {
    /// Protect a callable from the interpreter's garbage collector.
    fn pin(&self, handle: CallableHandle);

    /// Release a previously pinned callable.
    fn unpin(&self, handle: CallableHandle);

    /// Invoke a guard predicate; the scripted return value's truthiness
    /// is the verdict.
    fn call_predicate(&self, handle: CallableHandle) -> Result<bool, InterpreterError>;

    /// Invoke a block body for its side effects.
    fn call_block(&self, handle: CallableHandle) -> Result<(), InterpreterError>;
}

/// Shared handle to the scripting runtime.
pub type InterpreterRef = Arc<dyn Interpreter>;

/// A callable pinned against garbage collection for its own lifetime.
pub struct PinnedCallable {
    handle: CallableHandle,
    interp: InterpreterRef,
}

impl PinnedCallable {
    /// Pin `handle` and keep it alive until this value drops.
    pub fn new(interp: InterpreterRef, handle: CallableHandle) -> Self {
        interp.pin(handle);
        Self { handle, interp }
    }

    pub fn handle(&self) -> CallableHandle {
        self.handle
    }

    pub fn call_predicate(&self) -> Result<bool, InterpreterError> {
        self.interp.call_predicate(self.handle)
    }

    pub fn call_block(&self) -> Result<(), InterpreterError> {
        self.interp.call_block(self.handle)
    }
}

impl Clone for PinnedCallable {
    fn clone(&self) -> Self {
        // Each clone holds its own pin so drop order never matters.
        Self::new(self.interp.clone(), self.handle)
    }
}

impl Drop for PinnedCallable {
    fn drop(&mut self) {
        self.interp.unpin(self.handle);
    }
}

impl fmt::Debug for PinnedCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedCallable")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
