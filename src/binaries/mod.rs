pub mod catalog;
pub mod download;
pub mod extract;
pub mod manager;
pub mod mirror;
mod types;

pub use catalog::{Catalog, MirrorCatalogs};
pub use download::{DownloadError, Downloader, TransferProgress};
pub use extract::ExtractError;
pub use manager::{AcquireError, BinaryManager, ProgressCallback};
pub use mirror::{GeoLocator, IpApiLocator, MirrorError, MirrorSelector, MirrorSettings};
pub use types::*;
