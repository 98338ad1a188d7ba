//! Superpack - DLC pack delivery
//!
//! Fetches individual files out of a remote superpack archive with HTTP
//! range requests and keeps them in a local pack store, one pack (and its
//! dependencies) at a time.

pub mod archive;
pub mod dlc;
pub mod downloader;
pub mod graph;
pub mod hash;
pub mod logging;
pub mod meta;
pub mod paths;

#[cfg(test)]
mod test_server;
