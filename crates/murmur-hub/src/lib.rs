//! In-process push transport.
//!
//! [`LocalHub`] fans events out to every subscriber of a topic and keeps the
//! tracked beacons of each presence room, so a single process can run the
//! store, the transport and any number of timelines against each other.

pub mod hub;

pub use hub::LocalHub;
