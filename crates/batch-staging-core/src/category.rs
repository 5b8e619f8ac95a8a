//! Top-level staging categories used by the synchronization services.
//!
//! Collaborators lead their resource paths with one of these, e.g.
//! `resource_path![category::OUTGOING, "001-002", batch_id]`.

/// Batches extracted for a remote node.
pub const OUTGOING: &str = "outgoing";

/// Batches received from a remote node, before loading.
pub const INCOMING: &str = "incoming";

/// Batches staged by the loader.
pub const LOAD: &str = "load";

/// Acknowledgements awaiting transmission.
pub const ACK: &str = "ack";
