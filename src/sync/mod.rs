//! Background synchronization: connectivity, retries and debounced writes.

mod connectivity;
mod context;
mod debounce;
mod documents;
mod retry;

pub use connectivity::{ConnectivityProber, ConnectivitySnapshot, ConnectivityState, ProbeOutcome};
pub use context::SyncContext;
pub use debounce::{DebouncedWriter, PendingWrite, WriterState};
pub use documents::{ImageOrder, NoteDraft};
pub use retry::{with_retry, RetryCoordinator, RetryPolicy, RetryState};
