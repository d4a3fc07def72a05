//! Resource-Flow: a dependency-tracked resource cache.
//!
//! Resources are named, parameterized computations. Each instance is built
//! lazily on first read, memoized, and invalidated transitively when anything
//! it read changes.
//!
//! # Key Features
//!
//! - **Automatic dependency discovery**: generators read other resources through [`ResourceDeps`], which records the edges
//! - **Pull-based invalidation**: [`Resources::invalidate`] only marks resources stale; nothing is rebuilt until it is read
//! - **Deferred results**: generators may return a future, driven on a configured [`LocalSpawn`](futures::task::LocalSpawn) executor; out-of-order resolution never clobbers a newer result
//! - **Reference-counted disposal**: results may carry a cleanup hook that runs exactly once when the last holder lets go
//! - **Pluggable retention**: a [`NodeCollector`] decides which nodes survive [`Resources::collect`]
//!
//! # Example
//!
//! ```
//! use resource_flow::{Output, ResourcesBuilder};
//!
//! let resources = ResourcesBuilder::new()
//!     .add("/square", |_, args| {
//!         let n = match args[0] {
//!             resource_flow::Arg::Int(n) => n,
//!             _ => anyhow::bail!("expected an integer"),
//!         };
//!         Ok(Output::value(n * n))
//!     })
//!     .build();
//!
//! assert_eq!(resources.get::<i64>("/square", (7,))?.cloned(), Some(49));
//! # Ok::<(), resource_flow::ResourceError>(())
//! ```
//!
//! # Garbage Collection
//!
//! Every lookup marks the node as used. [`DefaultNodeCollector`] keeps the
//! marked nodes and their transitive dependencies, and frees everything else
//! once the number of kept nodes reaches its capacity. Custom policies can be
//! built on [`KeepPurger`].
#![deny(missing_docs)]

mod audit;
mod collector;
mod error;
mod key;
mod node;
mod output;
mod runtime;
mod storage;
mod value;

pub use audit::{AuditMode, AuditOptions};
pub use collector::{DefaultNodeCollector, KeepPurger, NodeCollector};
pub use error::ResourceError;
pub use key::{Arg, IntoArgs, PathKey, ResourceKey};
pub use node::{Node, NodeId, NodeSet};
pub use output::{Cleanup, Output, Resolved, Shared};
pub use runtime::{ResourceDeps, Resources, ResourcesBuilder};
pub use storage::NodeMap;
pub use value::{Handle, Wait};
