//! Retrieves the most recently acquired RT image series of a treatment plan from a DICOM archive.
//!
//! The [`retrieve`] module holds the query/retrieve logic, [`dimse`] the protocol layer it
//! runs on.

pub mod config;
pub mod dimse;
pub mod endpoint;
pub mod retrieve;
pub mod types;

/// The implementation class UID for rtqa-fetch.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.183745962074161827355603913786551930271";

/// The implementation version name for rtqa-fetch.
/// It consists of the string "RTQA-FETCH" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("RTQA-FETCH ", env!("CARGO_PKG_VERSION"));
