//! File serving: path resolution, directory listings and content delivery.
//!
//! Requests flow through three independent stages: [`resolver`] turns a
//! request target into a path confined to the serving root, [`transfer`]
//! answers with file content (full, ranged or HEAD), and [`browser`] renders
//! directories.

pub mod browser;
pub mod resolver;
pub mod transfer;

pub use browser::{BrowserError, DirectoryBrowser, DirectoryEntry};
pub use resolver::resolve;
pub use transfer::{
    ContentDelivery, Delivery, DeliveryError, RequestContext, TransferStrategy, BUFFER_CHUNK,
    MMAP_CHUNK, SMALL_FILE_THRESHOLD,
};
