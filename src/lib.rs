#![forbid(unsafe_code)]
//! Offline forensic access to container state on a dead disk.
//!
//! This library reconstructs the logical view of containers from a mounted
//! filesystem image of a host that ran containerd and/or Docker, without
//! either runtime being alive. It reads containerd's bolt-format metadata
//! databases and Docker's plain-file layout directly, resolves snapshot
//! chains into overlay mounts, recovers runtime state from cgroup residue,
//! and reports the filesystem drift a container accumulated on top of its
//! image.
//!
//! # Overview
//!
//! Everything flows through one contract, [`ContainerExplorer`], with a
//! backend per runtime:
//!
//! - [`ContainerdExplorer`] reads `meta.db` (manifest) and `metadata.db`
//!   (snapshotter) and walks the snapshot parent chain to compose overlay
//!   mounts.
//! - [`DockerExplorer`] reads `config.v2.json`, `repositories.json` and the
//!   overlay2 `layerdb` indirection.
//!
//! The analyzed image is never written to. Mounts are read-only overlays;
//! the only outputs are archives and raw images written to caller-chosen
//! directories, and all privileged operations (mount, losetup, mkfs, tar)
//! go through the [`CommandExecutor`] shim rather than being invoked
//! directly.
//!
//! # Example
//!
//! ```no_run
//! use coldctr::{ContainerExplorer, ContainerdExplorer, ContainerdOptions};
//!
//! let explorer = ContainerdExplorer::open(ContainerdOptions {
//!     image_root: "/mnt/image".into(),
//!     containerd_root: "/mnt/image/var/lib/containerd".into(),
//!     ..Default::default()
//! })?;
//!
//! for container in explorer.list_containers()? {
//!     println!("{}/{} {}", container.namespace, container.id, container.status);
//! }
//! # Ok::<(), coldctr::ExplorerError>(())
//! ```

// Storage readers
pub mod kvdb;
pub mod schema;

// Records
pub mod container;
pub mod image;
pub mod snapshot;

// Reconstruction and classification
pub mod drift;
pub mod runtime;
pub mod support;

// Privileged operations
pub mod exec;
pub mod export;
pub mod mount;

// Backends and the facade
pub mod containerd;
pub mod docker;
pub mod error;
pub mod explorer;

// Re-export commonly used types
pub use container::{Container, ContainerType};
pub use containerd::{ContainerdExplorer, ContainerdOptions};
pub use docker::{DockerExplorer, DockerOptions};
pub use drift::{Drift, DriftFileType, DriftOptions, FileInfo};
pub use error::{ExplorerError, Result};
pub use exec::{CommandExecutor, CommandOutput, SystemExecutor};
pub use explorer::{CancellationToken, ContainerExplorer};
pub use export::ExportOptions;
pub use image::{Content, Image};
pub use kvdb::KvDb;
pub use runtime::{Task, TaskStatus};
pub use snapshot::{OverlayPaths, SnapshotKeyInfo, SnapshotKind};
pub use support::SupportContainerPolicy;
