use std::fmt;

/// Identity of a [`BackendRecord`](crate::BackendStatus).
///
/// Non-negative ids are *real* (persisted, user-visible); negative ids are
/// *nonreal* (ephemeral, never written to the registry file). See spec §3
/// invariant 5 and Design Notes ("Nonreal backends").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct BackendId(pub i64);

impl BackendId {
    /// `true` for ids >= 0: persisted, user-visible backends.
    pub fn is_real(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing identifier for a submitted [`Request`](crate).
///
/// Used only for logging correlation (spec §4.4: "a single global counter
/// names requests for logging").
pub type RequestId = u64;
