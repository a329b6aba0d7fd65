//! HTTP request handlers.

pub mod exports;
pub mod imports;
pub mod system;

pub use exports::*;
pub use imports::*;
pub use system::*;
