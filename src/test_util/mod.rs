//! Utilities for testing code that runs on top of a [crate::udpconn::Port]. They are used by this
//!  crate's own tests, and they are exported for application testing.

pub mod pipe;
