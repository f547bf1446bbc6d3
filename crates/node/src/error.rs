#![allow(missing_docs)]
//! A bunch of wrap errors.

/// A wrap `Result` contains custom errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors enum mapping global custom errors.
/// The error type can be expressed in decimal, where the high decs represent
/// the error category and the low decs represent the error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[repr(u32)]
pub enum Error {
    #[error("Malformed url: {0}")]
    MalformedUrl(String) = 100,
    #[error("Malformed cid: {0}")]
    MalformedCid(String) = 101,
    #[error("Malformed path: {0}")]
    MalformedPath(String) = 102,
    #[error("Malformed input: {0}")]
    MalformedInput(String) = 103,
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String) = 104,
    #[error("Method {0} not allowed here")]
    MethodNotAllowed(String) = 105,
    #[error("Ipns name {0} could not be resolved")]
    IpnsUnresolved(String) = 200,
    #[error("No resolver set for ENS name {0}")]
    EnsUnresolvable(String) = 201,
    #[error("Unsupported contenthash codec: {0:#x}")]
    EnsUnsupportedCodec(u64) = 202,
    #[error("Ethereum rpc error: {0}")]
    EnsRpcError(String) = 203,
    #[error("Not found: {0}")]
    NotFound(String) = 300,
    #[error("Transport error: {0}")]
    Transport(#[from] peersky_transport::error::Error) = 301,
    #[error("Invalid archive: {0}")]
    ArchiveInvalid(String) = 500,
    #[error("Archive entry escapes extraction root: {0}")]
    ArchiveUnsafePath(String) = 501,
    #[error("No manifest found in package")]
    ManifestMissing = 502,
    #[error("Manifest is not valid JSON: {0}")]
    ManifestInvalidJson(String) = 503,
    #[error("Atomic move failed: {0}")]
    AtomicMoveFailed(String) = 504,
    #[error("No active room")]
    NoActiveRoom = 600,
    #[error("Room {0} not found")]
    RoomNotFound(String) = 601,
    #[error("Payload too large")]
    PayloadTooLarge = 602,
    #[error("Unknown room action: {0}")]
    UnknownRoomAction(String) = 603,
    #[error("Bind to local port failed: {0}")]
    BindFailed(String) = 604,
    #[error("Create file error: {0}")]
    CreateFileError(String) = 900,
    #[error("Open file error: {0}")]
    OpenFileError(String) = 901,
    #[error("Acquire lock failed")]
    Lock = 902,
    #[error("Cannot find home directory")]
    HomeDirError = 903,
    #[error("Cannot find parent directory")]
    ParentDirError = 904,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error) = 905,
    #[error("Serde json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error) = 1000,
    #[error("Serde yaml error: {0}")]
    SerdeYamlError(#[from] serde_yaml::Error) = 1001,
    #[error("Internal error: {0}")]
    Internal(String) = 1100,
}

impl Error {
    fn discriminant(&self) -> u32 {
        // SAFETY: Because `Self` is marked `repr(u32)`, its layout is a `repr(C)` `union`
        // between `repr(C)` structs, each of which has the `u32` discriminant as its first
        // field, so we can read the discriminant without offsetting the pointer.
        // This code is copy from
        // ref: https://doc.rust-lang.org/std/mem/fn.discriminant.html
        // And we modify it from [u8] to [u32], this is work because
        // repr(C) is equivalent to one of repr(u*) (see the next section) for
        // fieldless enums.
        // ref: https://doc.rust-lang.org/nomicon/other-reprs.html
        unsafe { *<*const _>::from(self).cast::<u32>() }
    }

    /// Numeric error code, category in the high decimals.
    pub fn code(&self) -> u32 {
        self.discriminant()
    }

    /// HTTP status the dispatcher reports this error with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::MalformedUrl(_)
            | Error::MalformedCid(_)
            | Error::MalformedPath(_)
            | Error::MalformedInput(_)
            | Error::UnsupportedScheme(_) => 400,
            Error::MethodNotAllowed(_) => 405,
            Error::NotFound(_)
            | Error::NoActiveRoom
            | Error::RoomNotFound(_)
            | Error::UnknownRoomAction(_) => 404,
            Error::PayloadTooLarge => 413,
            _ => 500,
        }
    }

    /// Exit code when an installer error bubbles to the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ArchiveInvalid(_) | Error::ArchiveUnsafePath(_) => 2,
            Error::ManifestMissing | Error::ManifestInvalidJson(_) => 3,
            Error::AtomicMoveFailed(_) => 4,
            _ => 1,
        }
    }
}
