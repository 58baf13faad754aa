//! Render graph error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::render_graph::{NodeId, NodeState, PortId};

/// Errors raised while building or running a render graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("cannot connect {src} to {dst}: source must be an output and destination an input")]
    InvalidPortDirection { src: PortId, dst: PortId },
    #[error("port {port} is out of range for node {node:?}")]
    PortOutOfRange { node: NodeId, port: PortId },
    #[error("node {0:?} does not belong to this graph")]
    UnknownNode(NodeId),
    #[error("node {0:?} cannot be connected to itself")]
    SelfConnection(NodeId),
    #[error("render graph contains a cycle through node {node:?}")]
    CyclicDependency { node: NodeId },
    #[error("input {index} of node {node:?} is not connected")]
    UnconnectedInput { node: NodeId, index: u32 },
    #[error("output {index} of node {node:?} has no image")]
    MissingOutput { node: NodeId, index: u32 },
    #[error("render graph is already baked")]
    AlreadyBaked,
    #[error("render graph is not baked")]
    NotBaked,
    #[error("cannot {operation} node {node:?} in state {state:?}")]
    InvalidState {
        node: NodeId,
        state: NodeState,
        operation: &'static str,
    },
    #[error("{what} capacity of {capacity} exceeded")]
    CapacityExceeded { what: &'static str, capacity: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::CapacityExceeded {
            what: "lights",
            capacity: 512,
        };
        assert_eq!(err.to_string(), "lights capacity of 512 exceeded");

        let err = GraphError::InvalidPortDirection {
            src: PortId::input(0),
            dst: PortId::input(1),
        };
        assert_eq!(
            err.to_string(),
            "cannot connect in0 to in1: source must be an output and destination an input"
        );

        let err: GraphError = BackendError::OutOfMemory.into();
        assert_eq!(err.to_string(), "Out of memory");
    }
}
