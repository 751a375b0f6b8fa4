//! This module contains utilities that are useful for testing code based on the CoAP reliability
//!  layer. They are used for testing the layer itself, but they are also exported for application
//!  testing.

pub mod addr;
pub mod channel;
pub mod event;
pub mod listener;
