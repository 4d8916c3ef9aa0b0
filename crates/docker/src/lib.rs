//! Thin façade over the Docker engine.
//!
//! The execution runtime talks to `ContainerDriver` only; the bollard-backed
//! `DockerDriver` is the production implementation. Kill and remove hold no
//! reference to the caller's deadline, so cleanup still works after the
//! execution deadline has expired.

pub mod driver;
pub mod error;

pub use driver::{ContainerDriver, ContainerSpec, ContainerStats, DockerDriver};
pub use error::{DockerError, Result};
