//! Error taxonomy for the constraint framework.

use thiserror::Error;

/// The finite set of error kinds the framework can surface.
///
/// Every [`Error`] variant maps onto exactly one kind; callers that need to
/// branch on category (rather than match the full enum) can use
/// [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CreatingClient,
    InvalidTemplate,
    MissingTemplate,
    InvalidConstraint,
    InvalidConstraintSchema,
    MissingConstraint,
    Autoreject,
    ReviewTypeMismatch,
    CannotChangeTargets,
    EngineInternal,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("creating client: {0}")]
    CreatingClient(String),

    #[error("invalid template {name}: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("missing template: {0}")]
    MissingTemplate(String),

    #[error("invalid constraint {kind}/{name}: {reason}")]
    InvalidConstraint {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("invalid constraint schema {kind}/{name}: {reason}")]
    InvalidConstraintSchema {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("missing constraint {kind}/{name}")]
    MissingConstraint { kind: String, name: String },

    #[error("autoreject: {message}")]
    Autoreject { message: String },

    #[error("review type mismatch: target {target} rejected input")]
    ReviewTypeMismatch { target: String },

    #[error("cannot change targets for template {name}: bound to {current}, got {requested}")]
    CannotChangeTargets {
        name: String,
        current: String,
        requested: String,
    },

    #[error("engine internal error: {0}")]
    EngineInternal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CreatingClient(_) => ErrorKind::CreatingClient,
            Error::InvalidTemplate { .. } => ErrorKind::InvalidTemplate,
            Error::MissingTemplate(_) => ErrorKind::MissingTemplate,
            Error::InvalidConstraint { .. } => ErrorKind::InvalidConstraint,
            Error::InvalidConstraintSchema { .. } => ErrorKind::InvalidConstraintSchema,
            Error::MissingConstraint { .. } => ErrorKind::MissingConstraint,
            Error::Autoreject { .. } => ErrorKind::Autoreject,
            Error::ReviewTypeMismatch { .. } => ErrorKind::ReviewTypeMismatch,
            Error::CannotChangeTargets { .. } => ErrorKind::CannotChangeTargets,
            Error::EngineInternal(_) => ErrorKind::EngineInternal,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the call that produced this error left the registry
    /// untouched (true for every validation-style error per §7 rule 1).
    pub fn is_registry_unchanged(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidTemplate
                | ErrorKind::InvalidConstraint
                | ErrorKind::InvalidConstraintSchema
                | ErrorKind::CannotChangeTargets
        )
    }
}
