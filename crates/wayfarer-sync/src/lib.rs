pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod memory;
pub mod remote;
pub mod state;

pub use backoff::Backoff;
pub use coordinator::{SyncCoordinator, SyncHandle, SyncOutcome};
pub use error::{RemoteError, SyncError, SyncResult};
pub use http::HttpRemoteStore;
pub use memory::{Fault, InMemoryRemoteStore};
pub use remote::{RemoteDelta, RemoteStore, UpsertOutcome};
pub use state::{validate_transition, OpKind, PendingOp, SyncState};
