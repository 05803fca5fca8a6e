use cirrus_store::EntityKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a handler for {0} is already registered")]
    DuplicateHandler(EntityKind),

    #[error("controller already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
