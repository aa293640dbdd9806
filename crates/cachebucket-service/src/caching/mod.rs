//! # Two-tier build cache
//!
//! Cache items are the outputs of build actions. The build tool identifies every action by an
//! `ActionID` and the content it produced by an `OutputID`, both opaque hashes that are
//! hex-encoded before they are used as file names or object keys.
//!
//! ## Cache Layers
//!
//! - A request-coalescing layer ([`Cacher`]) which makes sure that concurrent requests touching
//!   the same output only run once.
//! - A file-system layer ([`DiskStore`]) holding content-addressed output blobs, action links
//!   pointing at them, and negative-result markers for actions the remote tier does not know.
//! - A remote layer ([`RemoteStore`](crate::remote::RemoteStore)) which is the durable, shared
//!   copy of the cache.
//!
//! A lookup goes through the following steps:
//! - The local action link is consulted first. Once populated, the local tier is trusted and
//!   the remote tier is never contacted for an output blob that exists on disk.
//! - Without a local link, a negative-result marker short-circuits to a miss.
//! - Otherwise the action object is looked up remotely. A confirmed remote miss writes a
//!   negative-result marker, other remote errors fail the lookup.
//! - A remote hit links the action locally and downloads the output blob, streaming it straight
//!   into a temporary file which is then atomically moved into place.
//!
//! Stores write the blob locally and return as soon as that is done. Replication happens in the
//! background through the [`UploadQueue`], which is drained completely before the build tool is
//! told that the cache has been closed.
//!
//! ## Negative results
//!
//! Negative-result markers never expire. An output that shows up remotely after a marker was
//! written is not seen by this cache directory until the marker is removed.
//!
//! ### Metrics
//!
//! - `cache.get`: lookups, tagged with `result` (`local`, `remote`, `negative`, `miss`).
//! - `cache.flight.shared`: requests that joined an already running execution.
//! - `uploads.queued`, `uploads.store`, `uploads.duration`, `uploads.in_flight`: the background
//!   upload pipeline.

mod cache_error;
mod cacher;
mod disk;
mod tiered;
mod upload;


pub use cache_error::*;
pub use cacher::*;
pub use disk::*;
pub use tiered::*;
pub use upload::*;
