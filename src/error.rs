//! Error types for consensus validation

use thiserror::Error;

use crate::block_index::HeaderError;
use crate::mempool::MempoolRejection;
use crate::script::ScriptError;
use crate::utxo::UtxoError;

/// Failure taxonomy for everything the engine rejects.
///
/// The variant decides what the caller does next. Malformed data is
/// never retried and may cost the sender reputation. Contextual failures
/// poison descendants. Unresolvable data is buffered, and local policy
/// refusals are simply dropped. An internal invariant violation halts the
/// engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("malformed: {0}")]
    Malformed(String),

    #[error("contextually invalid: {0}")]
    ContextuallyInvalid(String),

    #[error("unresolvable: {0}")]
    Unresolvable(String),

    /// Valid by consensus but refused by local relay policy
    #[error("rejected by policy: {0}")]
    Policy(String),

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ConsensusError {
    /// The chain state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::InternalInvariantViolation(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ConsensusError::Malformed(_) | ConsensusError::Serialization(_)
        )
    }

    /// Whether the peer that relayed the offending data deserves a penalty.
    pub fn should_penalize_peer(&self) -> bool {
        matches!(
            self,
            ConsensusError::Malformed(_)
                | ConsensusError::Serialization(_)
                | ConsensusError::ContextuallyInvalid(_)
        )
    }

    /// Short reason string, without the category prefix.
    pub fn reason(&self) -> &str {
        match self {
            ConsensusError::Malformed(s)
            | ConsensusError::ContextuallyInvalid(s)
            | ConsensusError::Unresolvable(s)
            | ConsensusError::Policy(s)
            | ConsensusError::InternalInvariantViolation(s)
            | ConsensusError::Storage(s)
            | ConsensusError::Serialization(s)
            | ConsensusError::Config(s) => s,
        }
    }
}

impl From<ScriptError> for ConsensusError {
    fn from(e: ScriptError) -> Self {
        ConsensusError::ContextuallyInvalid(format!("script verification failed: {}", e))
    }
}

impl From<UtxoError> for ConsensusError {
    fn from(e: UtxoError) -> Self {
        ConsensusError::ContextuallyInvalid(e.to_string())
    }
}

impl From<HeaderError> for ConsensusError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::UnknownParent(_) | HeaderError::TimeTooNew { .. } => {
                ConsensusError::Unresolvable(e.to_string())
            }
            HeaderError::InvalidProofOfWork | HeaderError::BadDifficulty { .. } => {
                ConsensusError::Malformed(e.to_string())
            }
            _ => ConsensusError::ContextuallyInvalid(e.to_string()),
        }
    }
}

impl From<MempoolRejection> for ConsensusError {
    fn from(e: MempoolRejection) -> Self {
        match e {
            MempoolRejection::Malformed(_) => ConsensusError::Malformed(e.to_string()),
            MempoolRejection::MissingInput(_) => ConsensusError::Unresolvable(e.to_string()),
            MempoolRejection::Invalid(_) => ConsensusError::ContextuallyInvalid(e.to_string()),
            MempoolRejection::AlreadyInPool
            | MempoolRejection::ConflictsWithoutSufficientFeeBump(_)
            | MempoolRejection::BelowMinFee { .. }
            | MempoolRejection::NonFinal
            | MempoolRejection::ExceedsPoolSize => ConsensusError::Policy(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_flags() {
        let fatal = ConsensusError::InternalInvariantViolation("commitment mismatch".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.should_penalize_peer());

        let bad = ConsensusError::Malformed("bad merkle root".into());
        assert!(bad.is_malformed());
        assert!(bad.should_penalize_peer());

        let orphan = ConsensusError::Unresolvable("unknown parent".into());
        assert!(!orphan.should_penalize_peer());
        assert_eq!(orphan.reason(), "unknown parent");
    }

    #[test]
    fn test_mempool_policy_is_not_penalized() {
        for rejection in [
            MempoolRejection::AlreadyInPool,
            MempoolRejection::BelowMinFee { fee: 0, required: 100 },
            MempoolRejection::NonFinal,
            MempoolRejection::ExceedsPoolSize,
            MempoolRejection::ConflictsWithoutSufficientFeeBump("not replaceable".into()),
        ] {
            let e: ConsensusError = rejection.into();
            assert!(matches!(e, ConsensusError::Policy(_)));
            assert!(!e.should_penalize_peer());
        }

        let e: ConsensusError = MempoolRejection::Invalid("input 0 script failed".into()).into();
        assert!(e.should_penalize_peer());
    }

    #[test]
    fn test_script_error_is_contextual() {
        let e: ConsensusError = ScriptError::EvalFalse.into();
        assert!(matches!(e, ConsensusError::ContextuallyInvalid(_)));
    }
}
