#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate is the control core of an autonomous 3D-printing fleet: a
//! job queue, a scheduler matching queued jobs to idle printers by loaded
//! material, and a per-device state machine that prepares files, drives
//! prints, recovers hardware faults, and physically clears finished parts
//! off the build surface.

pub mod clearing;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod files;
pub mod fleet;
pub mod hms;
pub mod job;
pub mod kinematics;
pub mod machine;
pub mod noop;
pub mod prepare;
pub mod telemetry;
mod traits;

pub use traits::{FileStore, Transport};
