mod backups;
mod checkpoint;
mod executor;
mod fs_utils;
mod layout;
mod lock;
mod migrate;
mod releases;
mod store;

pub use backups::BackupStore;
pub use checkpoint::{
    append_journal_entry, read_checkpoint, read_journal, write_checkpoint, Checkpoint,
    CheckpointStatus, JournalEntry, StepState,
};
pub use executor::{
    read_active_version, CancelToken, ExecutionObserver, ExecutionOutcome, ExecutorOptions,
    LifecycleExecutor, NoopObserver, RepairReport,
};
pub use layout::{default_user_prefix, InstallLayout};
pub use lock::{read_lease, InstallLock, LeaseRecord};
pub use migrate::{CommandMigrator, MigrationProbe, Migrator};
pub use releases::{DirectoryReleaseSource, RELEASE_MANIFEST_FILE, RELEASE_SIGNATURE_FILE};
pub use store::StateStore;
