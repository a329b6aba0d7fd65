//! Repository traits for record operations.

pub mod files;
pub mod models;
pub mod releases;

pub use files::FileRepo;
pub use models::ModelRepo;
pub use releases::ReleaseRepo;
