//! # snapset Core
//!
//! Coordinated, application-consistent snapshot sets across SAN LUNs,
//! clustered NAS filesystems and node-local logical volumes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Coordinator                        │
//! │   (create, remove, restore, list, validate)             │
//! └──────┬──────────────┬───────────────┬───────────────────┘
//!        ▼              ▼               ▼
//! ┌────────────┐  ┌────────────┐  ┌─────────────┐
//! │  Planner   │─▶│  Executor  │  │  Inspector  │
//! └─────┬──────┘  └─────┬──────┘  └──────┬──────┘
//!       │               ▼                │
//!       │   ┌───────────────────────┐    │
//!       └──▶│ Quiescers  │  Cluster │◀───┘
//!           ├───────────────────────┤
//!           │ SAN │ NAS │ Vol drivers│
//!           └───────────────────────┘
//!                       ▲
//!                 Model Reader (DM REST)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use snapset_core::{Coordinator, CreateOptions, SetName};
//!
//! let set = SetName::new("nightly")?;
//! let manifest = coordinator.create_snapshot(&set, CreateOptions::default()).await?;
//! println!("{} snapshots taken", manifest.len());
//! ```

pub mod agent_api;
pub mod cluster;
pub mod cmd;
pub mod context;
pub mod coordinator;
pub mod credentials;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod inspect;
pub mod metadata;
pub mod mock;
pub mod model;
pub mod naming;
pub mod plan;
pub mod quiesce;
pub mod retry;
pub mod rpc;
pub mod settings;

pub use context::{Context, DriverFactory, VendorDriverFactory};
pub use coordinator::{Coordinator, CreateOptions};
pub use credentials::{CommandDecrypter, Decrypter, StaticDecrypter};
pub use error::{Error, ErrorKind, ExitCode, Result};
pub use executor::{CancelFlag, Executor, RunReport, StepRecord};
pub use inspect::{Entry, Presence, SetReport, Verdict};
pub use metadata::{ManifestEntry, MetadataStore, SetMetadata, SetState};
pub use model::{ModelClient, ModelReader, RestModelClient};
pub use naming::{SetName, SetSelector, SnapNames};
pub use rpc::{HttpTransport, RpcClient, RpcTransport};
pub use settings::Settings;
