//! Widget CRD Definitions
//!
//! Sample custom resource served by the widget controller.

pub mod widget;

pub use widget::*;
