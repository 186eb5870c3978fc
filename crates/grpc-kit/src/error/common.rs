//! Standardized error reporting between gRPC services.
//!
//! A [`CommonError`] is a numeric code plus a human readable message. Status
//! codes received from remote services are folded into the common code space
//! by [`CommonError::from`], and handlers can turn a [`CommonError`] back into
//! a [`Status`] with the reverse mapping.

use super::codes::{
    CODE_OK, ERR_CODE_GRPC, ERR_CODE_SERVER, ERR_CODE_TIMEOUT, ERR_CODE_UNKNOWN,
};
use tonic::{Code, Status};

/// Code + message error used uniformly by clients, servers and the pool.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("error: code={code}, msg={msg}")]
pub struct CommonError {
    code: i32,
    msg: String,
}

impl CommonError {
    /// Creates a new error, or `None` if `code` is [`CODE_OK`].
    pub fn new(code: i32, msg: impl Into<String>) -> Option<Self> {
        if code == CODE_OK {
            return None;
        }
        Some(Self {
            code,
            msg: msg.into(),
        })
    }

    pub fn grpc(msg: impl Into<String>) -> Self {
        Self::with_code(ERR_CODE_GRPC, msg)
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::with_code(ERR_CODE_SERVER, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_code(ERR_CODE_TIMEOUT, msg)
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::with_code(ERR_CODE_UNKNOWN, msg)
    }

    // Callers guarantee a non-OK code.
    pub(crate) fn with_code(code: i32, msg: impl Into<String>) -> Self {
        debug_assert_ne!(code, CODE_OK);
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub const fn code(&self) -> i32 {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Converts an arbitrary error into a [`CommonError`].
    ///
    /// The error chain is searched for an existing [`CommonError`] (returned
    /// unchanged) or a [`Status`] (translated). Anything else becomes an
    /// [`ERR_CODE_UNKNOWN`] error carrying the outermost message.
    pub fn convert(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(common) = e.downcast_ref::<CommonError>() {
                return common.clone();
            }
            if let Some(status) = e.downcast_ref::<Status>() {
                return Self::from(status);
            }
            current = e.source();
        }
        Self::unknown(err.to_string())
    }
}

fn grpc_to_common_code(code: Code) -> i32 {
    match code {
        Code::Unknown => ERR_CODE_UNKNOWN,
        Code::Internal => ERR_CODE_SERVER,
        Code::DeadlineExceeded => ERR_CODE_TIMEOUT,
        other => other as i32,
    }
}

fn common_to_grpc_code(code: i32) -> Code {
    match code {
        ERR_CODE_UNKNOWN => Code::Unknown,
        ERR_CODE_SERVER => Code::Internal,
        ERR_CODE_TIMEOUT => Code::DeadlineExceeded,
        // Pass-through gRPC codes keep their meaning, pool codes and other
        // service-defined codes surface as internal errors.
        c if (0..=16).contains(&c) => Code::from_i32(c),
        _ => Code::Internal,
    }
}

impl From<&Status> for CommonError {
    fn from(status: &Status) -> Self {
        Self {
            code: grpc_to_common_code(status.code()),
            msg: status.message().to_string(),
        }
    }
}

impl From<Status> for CommonError {
    fn from(status: Status) -> Self {
        Self::from(&status)
    }
}

impl From<CommonError> for Status {
    fn from(err: CommonError) -> Self {
        Status::new(common_to_grpc_code(err.code), err.msg)
    }
}
