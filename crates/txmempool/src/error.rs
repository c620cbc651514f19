use bitcoin::Txid;

/// Package limit violations reported by ancestor calculation.
///
/// These are admission-control outcomes, not failures: the caller rejects the
/// candidate transaction and moves on. Eviction and block removal never fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MempoolError {
    #[error("too many unconfirmed ancestors [limit: {limit}]")]
    TooManyAncestors { limit: u64 },

    #[error("exceeds ancestor size limit [limit: {limit}]")]
    AncestorSizeExceeded { limit: u64 },

    #[error("too many descendants for tx {txid} [limit: {limit}]")]
    TooManyDescendants { txid: Txid, limit: u64 },

    #[error("exceeds descendant size limit for tx {txid} [limit: {limit}]")]
    DescendantSizeExceeded { txid: Txid, limit: u64 },
}
