mod archive;
mod config;
mod downloader;
mod error;
mod installer;
mod job;
mod manifest;
mod progress;
mod registry;
mod unpacker;
mod version_util;
mod worker_pool;

pub use archive::*;
pub use config::*;
pub use downloader::*;
pub use error::*;
pub use installer::*;
pub use job::*;
pub use manifest::*;
pub use progress::*;
pub use registry::*;
pub use unpacker::*;
pub use version_util::*;
pub use worker_pool::*;
