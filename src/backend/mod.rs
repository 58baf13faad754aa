//! Backend abstraction layer
//!
//! Provides the backend trait and the types shared by the Vulkan and dummy
//! implementations.

pub mod dummy;
pub mod layout;
pub mod traits;
pub mod types;
pub mod vulkan;

pub use layout::*;
pub use traits::*;
pub use types::*;
