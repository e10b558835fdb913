use crate::core::errors::GateRejection;

/// Pre-execution check over an artifact's source text.
///
/// Implementations are pure functions of their input and advisory only; see
/// [`GateRejection`].
#[mockall::automock]
pub trait Gate: std::fmt::Debug + Send + Sync {
    fn check(&self, source: &str) -> Result<(), GateRejection>;
}
