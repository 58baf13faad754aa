//! Render Graph System
//!
//! Passes are nodes with numbered input and output ports. Outputs own GPU
//! images; inputs reference an upstream output. Baking walks backward from a
//! terminal node and fixes a producers-first execution order.

pub mod context;
pub mod graph;
pub mod node;
pub mod port;

pub use context::*;
pub use graph::*;
pub use node::*;
pub use port::*;
