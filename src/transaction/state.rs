//! Transaction state management.

/// The possible states of a transaction.
///
/// `Active -> Committing -> Committed` or `Active -> RolledBack`. A commit
/// whose log append fails also ends in `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Commands can still be added.
    Active,
    /// The commit pipeline owns the transaction; it can no longer be cancelled.
    Committing,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Returns true if the transaction is active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if the transaction is committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    /// Returns true if the transaction is finished (committed or rolled back).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_become(&self, next: TransactionState) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Committing)
                | (Self::Active, Self::RolledBack)
                | (Self::Committing, Self::Committed)
                | (Self::Committing, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committing => write!(f, "Committing"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}
