use thiserror::Error;

/// Errors surfaced by the bridge.
///
/// The taxonomy splits into three groups:
///
/// - **Integration errors** (`TypeMismatch`): a handle was presented with
///   the wrong resource kind. These indicate a bug in the binding layer,
///   not a runtime condition, and callers are expected to treat them as
///   fatal.
/// - **Protocol errors** (`UseAfterConsume`, `ResponseAlreadyCreated`,
///   `ResponseAlreadySent`, `StreamAlreadyCreated`, `StreamClosed`,
///   `CallAlreadyEnded`, `ParamOutOfRange`, `ParamType`): a lifecycle rule
///   was violated. Engine state is untouched and the caller may continue.
/// - **Engine errors** (`Engine`): the engine rejected an operation.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Handle kind mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error("Handle used after its resource was consumed")]
    UseAfterConsume,

    #[error("Cannot create more than one response from one request")]
    ResponseAlreadyCreated,

    #[error("Response already sent")]
    ResponseAlreadySent,

    #[error("Stream already created for this response")]
    StreamAlreadyCreated,

    #[error("Stream already closed")]
    StreamClosed,

    #[error("RPC call already ended")]
    CallAlreadyEnded,

    #[error("Server already listening")]
    AlreadyListening,

    #[error("RPC parameter index {0} out of range")]
    ParamOutOfRange(usize),

    #[error("RPC parameter is not a {expected}")]
    ParamType { expected: &'static str },

    #[error("Engine error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
