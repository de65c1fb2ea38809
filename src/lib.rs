//! # Gridflow
//!
//! A **distributed columnar query execution fabric**: a central router
//! batches query plans arriving from external planners, clusters them by
//! the base columns they share, decides with a contention-aware cost model
//! which columns to pre-stage from far memory (CXL / remote NUMA) into
//! local DRAM, and dispatches the rewritten groups to compute units that
//! execute the physical operators over chunked, progressively-published
//! column data.
//!
//! ## Architecture
//!
//! ```text
//! planner ──▶ router ──▶ window collection ──▶ grouper (cluster + cost model)
//!                │                                   │
//!                │                                   ▼ QueryGroup
//!                └────────── responses ◀── compute unit front-end
//!                                               │
//!                                   plan orchestrator (event loop + GC)
//!                                               │
//!                                     operator dispatcher ──▶ worker pool
//!                                               │
//!                                            catalog ──▶ columns
//! ```
//!
//! ## Core pieces
//!
//! - [`column`] - typed, chunk-addressable buffers with a progress cursor;
//!   readers block until the producer's watermark covers the chunk they
//!   need, so consumers overlap with producers.
//! - [`catalog`] - the process-wide `(table, column)` registry with shared
//!   column ownership.
//! - [`orchestrator`] - the per-unit dependency scheduler: a single event
//!   loop owns all plan state, a GC thread reclaims finished plans.
//! - [`worker`] - the pinned worker pool with live resize and
//!   forward-on-drain.
//! - [`router`] - window collection, superset-absorption clustering, the
//!   CXL/DRAM transfer cost model, and group assembly.
//! - [`net`] - framed TCP messaging (`magic | meta | bincode payload`)
//!   shared by the router server and the unit client.
//! - [`operators`] - the physical operators, all written against the
//!   chunked data-flow protocol.
//!
//! ## Plans
//!
//! A plan is a flat list of work items with `depends_on` edges forming a
//! DAG that ends in a single `Result` item. The router validates plans
//! ([`dag`]) before grouping; compute units schedule items strictly after
//! their dependencies completed and cancel the remainder of a plan when
//! any item fails. A failed plan cancels that plan only.

pub mod catalog;
pub mod column;
pub mod dag;
pub mod dictionary;
pub mod dispatch;
pub mod ident;
pub mod ingest;
pub mod net;
pub mod operators;
pub mod orchestrator;
pub mod plan;
pub mod router;
pub mod testing;
pub mod unit;
pub mod utils;
pub mod worker;

// General re-exports
pub use catalog::Catalog;
pub use column::{ChunkCursor, Column, DataType};
pub use dag::{PlanDag, ValidationReport};
pub use dictionary::Dictionary;
pub use dispatch::OperatorDispatcher;
pub use ident::UniqueId;
pub use orchestrator::{ItemStatus, OrchestratorConfig, PlanOrchestrator, PlanStatus};
pub use plan::{QueryGroup, QueryPlan, WorkItem};
pub use router::{CollectionManager, Grouper, GroupingConfig, HardwareConfig};
pub use unit::UnitFrontend;
pub use utils::OrdF64;
pub use worker::{Task, Topology, WorkerPool};
