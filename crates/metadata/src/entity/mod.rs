//! Sea-ORM entities mirroring the metadata schema.

pub mod functions;
pub mod invocations;
