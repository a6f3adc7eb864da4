//! Persistence layer for armada.
//!
//! Everything the orchestrator keeps at rest lives in a coordination-service
//! key-value tree: versioned records with per-key compare-and-set, ephemeral
//! sequential nodes for leader election, and a session whose loss the process
//! must react to. The [`kv::CoordinationStore`] trait abstracts the service;
//! [`memory::MemoryStore`] is the in-process implementation used by tests and
//! embedded deployments. Typed access goes through [`repository::Repository`]
//! (one key space per record category) and the leader-local
//! [`cache::LazyCachingRepository`]. Storage format upgrades run through
//! [`migration::Migrator`] before any repository is handed out.

pub mod cache;
pub mod kv;
pub mod memory;
pub mod migration;
pub mod repository;

pub use cache::LazyCachingRepository;
pub use kv::{
    retrying, CoordinationStore, NodeVersion, RetryPolicy, SessionState, StoreError, StoreEvent,
    StoreEventKind, VersionedNode,
};
pub use memory::MemoryStore;
pub use migration::{MigrationError, MigrationStep, Migrator};
pub use repository::{Record, Repository, StorageVersion};
