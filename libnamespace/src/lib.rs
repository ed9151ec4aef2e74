//! Core of the namespace master: a hierarchical namespace cached over one or
//! more under file systems, made durable by a write-ahead journal.

pub mod block;
pub mod config;
pub mod consistency;
pub mod dataplane;
pub mod error;
pub mod inode;
pub mod journal;
pub mod lock;
pub mod master;
pub mod mount;
pub mod path;
pub mod persist;
pub mod rpc;
pub mod tree;
pub mod ttl;
pub mod ufs;

pub use config::MasterConfig;
pub use consistency::{ConsistencyReport, Inconsistency, InconsistencyKind};
pub use dataplane::{DataPlane, DirDataPlane, MemoryDataPlane};
pub use error::{ErrorKind, MasterError, Result};
pub use master::NamespaceMaster;
pub use mount::{MountEntry, ROOT_MOUNT_ID};
pub use path::NsPath;
pub use persist::PersistFailure;
pub use rpc::{Request, Response, handle};
pub use ufs::{DefaultUfsFactory, LocalUfs, MemoryUfs, UfsFactory, UnderFileSystem};
