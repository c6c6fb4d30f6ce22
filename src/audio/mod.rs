//! Device-side audio handling.

pub mod frontend;

pub use frontend::{AudioFrontend, normalize_frame};
