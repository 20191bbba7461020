// Cluster transport seam
use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Outcome of handing a frame to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Absent,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether any remote peer has a cluster-visible registration on `address`.
    fn has_remote(&self, address: &str) -> bool;

    /// Delivers an encoded envelope: to one peer for a send frame, to every
    /// peer for a publish frame.
    async fn deliver(&self, address: &str, frame: Bytes) -> Result<Delivery>;
}
