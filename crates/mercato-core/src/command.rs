//! Command abstractions.

use uuid::Uuid;

/// Trait that all commands implement.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str;

    /// Correlation ID to trace this command through the system.
    fn correlation_id(&self) -> Uuid;

    /// The actor issuing the command.
    fn user_id(&self) -> &str;
}

/// Who issued a command and which request it belongs to.
///
/// Passed into aggregate operations so every recorded event carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMetadata {
    /// Correlation ID of the originating request.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
}

impl CommandMetadata {
    /// Captures the metadata of `command`.
    pub fn of<C: Command + ?Sized>(command: &C) -> Self {
        Self {
            correlation_id: command.correlation_id(),
            user_id: command.user_id().to_owned(),
        }
    }
}
