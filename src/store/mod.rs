pub mod branches;
pub mod events;
pub mod integrity;
pub mod snapshot;
pub mod versions;

pub use branches::BranchManager;
pub use events::{EventBus, StoreEvent};
pub use integrity::{check_integrity, IntegrityIssue};
pub use snapshot::{
    ExportFormat, ExportOptions, ImportMode, ImportOptions, InMemorySnapshotStore,
    JsonFileSnapshotStore, Snapshot, SnapshotStore,
};
pub use versions::VersionStore;
