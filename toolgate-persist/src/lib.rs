pub mod checkpoint;
pub mod store;

// Re-export key types for convenience.
pub use checkpoint::Acknowledgement;
pub use checkpoint::Checkpoint;
pub use checkpoint::CheckpointManager;
pub use checkpoint::PendingOutput;
pub use checkpoint::ResumePoint;
pub use store::CheckpointError;
pub use store::CheckpointStore;
pub use store::JsonFileStore;
