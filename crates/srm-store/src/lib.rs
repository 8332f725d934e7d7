//! Persistence for the site resource manager.
//!
//! [`Store`] is the seam every frontend component goes through. Two
//! implementations ship: [`SqliteStore`] (sqlx, used by the daemons) and
//! [`MemoryStore`] (tests and single-process setups).
//!
//! The active-deltas document lives in a single row and is only written
//! through [`Store::compare_and_set_active_deltas`], which keeps exactly one
//! writer effective at a time.

mod error;
mod hooks;
mod memory;
mod pool;
mod records;
mod sqlite;
mod store;

pub use error::{DbError, DbResult};
pub use hooks::StoreHooks;
pub use memory::MemoryStore;
pub use pool::{bootstrap_schema, create_memory_pool, create_pool};
pub use records::{
    connection_state, ActiveDeltasRecord, DeltaConnection, DeltaTimeState, DeltaUpdate,
    HostRecord, HostStateRecord, InstanceStartEnd, ModelRecord, RefreshTokenRecord,
    ServiceAction, ServiceRecord, ServiceStateRecord, StateRecord, SwitchRecord, UserRecord,
    ACTION_RELOAD,
};
pub use sqlite::SqliteStore;
pub use store::Store;
