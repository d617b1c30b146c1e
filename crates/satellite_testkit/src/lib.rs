//! # Satellite Testkit
//!
//! Test utilities for the satellite engine.
//!
//! This crate provides:
//! - An in-process reference replication service
//! - A connector that dials it without sockets
//! - Fixtures for opening satellites against it
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use satellite_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn replicates() {
//!     let service = ReferenceService::new();
//!     let a = TestSatellite::open(&service, "a").await.unwrap();
//!     a.satellite.start().unwrap();
//!     a.insert_item(1, "pen", 3).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connector;
pub mod fixtures;
pub mod generators;
pub mod service;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connector::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::service::*;
}

pub use connector::*;
pub use fixtures::*;
pub use generators::*;
pub use service::*;
