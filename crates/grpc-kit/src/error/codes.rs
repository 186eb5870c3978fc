/// Returned by gRPC handlers on success. Never carried by a [`CommonError`].
///
/// [`CommonError`]: super::CommonError
pub const CODE_OK: i32 = 0;

pub const ERR_CODE_GRPC: i32 = 1;
pub const ERR_CODE_SERVER: i32 = 2;
pub const ERR_CODE_UNKNOWN: i32 = 3;
pub const ERR_CODE_TIMEOUT: i32 = 4;

// Pool codes sit above the gRPC status range so that status codes passed
// through by conversion never collide with them.
pub const ERR_CODE_POOL_NOT_INITIALIZED: i32 = 1001;
pub const ERR_CODE_POOL_CLOSED: i32 = 1002;
pub const ERR_CODE_SELECTOR_CLOSED: i32 = 1003;
pub const ERR_CODE_POOL_CREATION: i32 = 1004;
pub const ERR_CODE_CANCELLED: i32 = 1005;
pub const ERR_CODE_INVALID_CONFIG: i32 = 1006;

pub const ERR_MSG_SERVER: &str = "server error";
pub const ERR_MSG_UNKNOWN: &str = "unknown error";
pub const ERR_MSG_TIMEOUT: &str = "request timed out";
