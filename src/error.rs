//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Xornet crate error enum.
pub enum Error {
    /// Indicates that an id was constructed from a slice of the wrong length.
    #[error("Invalid id size: {0}, expected 64 bytes")]
    InvalidIdSize(usize),

    /// Indicates that an id field is all zeros where a real peer id is required.
    #[error("Zero id is not a valid peer id")]
    ZeroId,

    #[error("Failed to parse message bytes: {0}")]
    WireFormat(#[from] serde_bencode::Error),

    /// None of the supplied bootstrap endpoints accepted a connection.
    #[error("No online bootstrap contacts")]
    NoBootstrapContacts,

    /// The routing table has no candidate next hop for the destination.
    #[error("Routing table is empty, re-bootstrap required")]
    EmptyRoutingTable,

    /// The network has been stopped; no further sends are possible.
    #[error("Network stopped")]
    Stopped,

    /// A pending response was not received before its deadline.
    #[error("Response timed out for message id {0}")]
    ResponseTimeout(u32),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
