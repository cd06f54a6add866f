//! Header representation within the header store.

use opentxs_common::{Header, HeaderStatus, Position, Work};

/// A stored header plus the chain metadata derived from it.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct HeaderRecord {
    #[n(0)]
    pub header: Header,

    /// Cumulative work from genesis; `None` while the parent is unknown.
    #[n(1)]
    pub work: Option<Work>,

    /// Status assigned to this header on its own.
    #[n(2)]
    pub local_status: HeaderStatus,

    /// Local status combined with every ancestor's restriction.
    #[n(3)]
    pub status: HeaderStatus,

    /// Acceptance order, used to break ties in cumulative work.
    #[n(4)]
    pub sequence: u64,
}

impl HeaderRecord {
    /// A header whose parent is not yet connected.
    pub fn disconnected(header: Header) -> Self {
        Self {
            header,
            work: None,
            local_status: HeaderStatus::Disconnected,
            status: HeaderStatus::Disconnected,
            sequence: 0,
        }
    }

    pub fn position(&self) -> Position {
        self.header.position()
    }

    pub fn is_connected(&self) -> bool {
        self.status != HeaderStatus::Disconnected
    }

    /// Whether this header may be selected as the best tip.
    pub fn is_candidate(&self) -> bool {
        self.status.is_candidate() && self.work.is_some()
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        minicbor::encode(self, &mut bytes).expect("infallible");
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}
