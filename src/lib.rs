//! The acs-engine cluster autoscaler
//!
//! Exposed as a library so the integration tests can drive the scaler
//! against mock cluster and cloud implementations.

pub mod args;
pub mod libs;
#[cfg(any(test, feature = "test-utilities"))]
pub mod test_utilities;

pub use libs::Error;
