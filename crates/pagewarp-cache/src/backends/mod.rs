//! Leaf storage backends: everything that actually holds bytes, as
//! opposed to the adapters in `compose` that rearrange calls.

pub mod file;
pub mod lru;
pub mod remote;
pub mod shm;

pub use file::{FileCache, FileCachePolicy};
pub use lru::{LruCache, LruCacheBase, LruStats, SharedValueHelper, ValueHelper};
pub use remote::{KeyValueClient, RemoteCache, RemoteCacheOptions, RemoteError};
pub use shm::{ShmCache, ShmCachePolicy};
