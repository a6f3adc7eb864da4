//! Armada: a container workload orchestrator for two-level resource-offer
//! clusters.
//!
//! Operators declare a tree of apps, pods, and groups; the elected leader
//! converges the cluster to it by matching offers against pending launches,
//! rolling deployments forward, and holding instance state authoritative
//! through failures and failovers.
//!
//! The crate is organized around single-owner async actors:
//!
//! - [`tracker`] owns instance state, mutated only through the pure state
//!   machine in [`instance::state_machine`];
//! - [`launch`] owns scheduling demand: the launch queue, the offer
//!   processor, and offer revive/suppress signalling;
//! - [`deploy`] compiles group diffs into plans and supervises their steps;
//! - [`kill`] drives the batched, retrying kill pipeline;
//! - [`reconcile`] flags overdue work and keeps bus state converged;
//! - [`leader`] elects the single writer; [`scope`] is everything that only
//!   exists while leading.
//!
//! Persistence lives in the `armada-store` crate; the offer-bus wire
//! protocol and the HTTP surface are adapters outside this crate, talking
//! to it through [`driver`] and [`scope::LeaderScope`].

pub mod clock;
pub mod config;
pub mod deploy;
pub mod driver;
pub mod error;
pub mod events;
pub mod instance;
pub mod kill;
pub mod launch;
pub mod leader;
pub mod matcher;
pub mod reconcile;
pub mod scope;
pub mod spec;
pub mod tracker;

pub use config::Config;
pub use error::CoreError;
pub use scope::LeaderScope;
