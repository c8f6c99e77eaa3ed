use crate::modules::indexer::ValueStoreError;
use crate::modules::storage::kv::KvError;
use cid::Cid;
use errors::AppError;
use libp2p::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during advertisement ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Caller supplied an invalid argument (fast-fail, no side effects).
    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// Advertisement signature did not verify against its provider identity.
    #[error("bad signature on advertisement {ad}: {reason}")]
    BadSignature { ad: Cid, reason: String },

    /// A stored or fetched node failed to decode.
    #[error("failed to decode node {cid}: {reason}")]
    Decode { cid: Cid, reason: String },

    /// A referenced block could not be found or fetched. Transient: the
    /// owning advertisement fails and is retried by a later sync.
    #[error("missing block {0}")]
    Missing(Cid),

    /// Datastore I/O failure.
    #[error(transparent)]
    Storage(#[from] KvError),

    /// Value store I/O failure.
    #[error(transparent)]
    ValueStore(#[from] ValueStoreError),

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The sync exceeded its configured deadline.
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),

    /// Publisher rejected by the admission policy.
    #[error("publisher {0} is not authorized")]
    Unauthorized(PeerId),

    /// Immediate subscriber-side failure starting a sync.
    #[error("subscriber error: {0}")]
    Subscriber(String),
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::BadArgument(msg) => AppError::InvalidArgument(msg),
            IngestError::Unauthorized(peer) => {
                AppError::Conflict(format!("publisher {} is not authorized", peer))
            }
            IngestError::Storage(e) => e.into(),
            IngestError::ValueStore(e) => e.into(),
            IngestError::Missing(cid) => AppError::NotFound(cid.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
