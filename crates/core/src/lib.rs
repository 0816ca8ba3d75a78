//! Domain types shared across the jobmill workspace.
//!
//! Pure data: identifiers, task/job/run models, the build and run state
//! machines, and the wire types of the child-process control protocol.
//! No I/O lives here; the engine crate consumes these types and the
//! persistence layer (outside this workspace) stores them.

pub mod error;
pub mod job;
pub mod messages;
pub mod task;
pub mod types;
