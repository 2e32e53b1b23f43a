//! Filesystem-backed object storage engine

mod engine;

pub use engine::{
    DeleteOutcome, ListPage, ObjectStore, StorageError, VersionsPage, WriteOptions,
};
