pub mod downloader;
pub mod filename;
pub mod integrity;
pub mod manifest;
pub mod merger;
pub mod models;
pub mod options;
pub mod planner;
pub mod session;
pub mod worker;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::downloader::{DownloadError, Downloader, ResourceInfo};
    pub use crate::models::{DownloadStatus, Outcome, SegmentSpec, SegmentTable};
    pub use crate::options::{DownloadOptions, RequestOptions};
    pub use crate::session::Session;
}
