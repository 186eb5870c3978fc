//! Package-scoped error kinds.
//!
//! An [`ErrorType`] identifies a class of error by the package that raises it
//! and a numeric code. Errors built from it ([`TypedError`]) can be matched
//! with [`ErrorType::is`] and re-scoped with [`ErrorType::wrap`], which keeps
//! the inner error's rendering in the message so the chain stays readable in
//! logs.

/// Identifies an error class: the raising package plus a numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErrorType {
    pub pkg: &'static str,
    pub code: i32,
}

/// An error tagged with its [`ErrorType`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("error: code={}, pkg={}, msg={msg}", .kind.code, .kind.pkg)]
pub struct TypedError {
    kind: ErrorType,
    msg: String,
}

impl TypedError {
    pub const fn kind(&self) -> ErrorType {
        self.kind
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl ErrorType {
    pub const fn new_type(pkg: &'static str, code: i32) -> Self {
        Self { pkg, code }
    }

    pub fn new(&self, msg: impl Into<String>) -> TypedError {
        TypedError {
            kind: *self,
            msg: msg.into(),
        }
    }

    /// Returns true if `err` is a [`TypedError`] of exactly this type.
    pub fn is(&self, err: &(dyn std::error::Error + 'static)) -> bool {
        err.downcast_ref::<TypedError>()
            .is_some_and(|typed| typed.kind == *self)
    }

    /// Re-scopes `err` under this type.
    ///
    /// An error already of this type is returned unchanged. A [`TypedError`]
    /// of another type is folded into the message as `"{msg} | {err}"`. Any
    /// other error becomes a new error carrying its display string.
    pub fn wrap(&self, err: &(dyn std::error::Error + 'static)) -> TypedError {
        match err.downcast_ref::<TypedError>() {
            Some(typed) if typed.kind == *self => typed.clone(),
            Some(typed) => self.new(format!("{} | {}", typed.msg, typed)),
            None => self.new(err.to_string()),
        }
    }

    /// Like [`ErrorType::wrap`], but replaces the message with `msg`.
    pub fn wrap_with_msg(
        &self,
        err: &(dyn std::error::Error + 'static),
        msg: impl Into<String>,
    ) -> TypedError {
        match err.downcast_ref::<TypedError>() {
            Some(typed) if typed.kind == *self => TypedError {
                kind: *self,
                msg: msg.into(),
            },
            Some(typed) => self.new(format!("{} | {}", msg.into(), typed)),
            None => self.new(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE_11: ErrorType = ErrorType::new_type("dummypackage1", 1000);
    const TYPE_22: ErrorType = ErrorType::new_type("dummypackage2", 2000);
    const TYPE_13: ErrorType = ErrorType::new_type("dummypackage3", 1000);
    const TYPE_21: ErrorType = ErrorType::new_type("dummypackage1", 2000);

    #[test]
    fn same_code_different_pkg_is_false() {
        let e11 = TYPE_11.new("one");
        let e13 = TYPE_13.new("one");

        assert!(!TYPE_13.is(&e11));
        assert!(!TYPE_11.is(&e13));
    }

    #[test]
    fn different_code_same_pkg_is_false() {
        let e11 = TYPE_11.new("one");
        let e21 = TYPE_21.new("one");

        assert!(!TYPE_21.is(&e11));
        assert!(!TYPE_11.is(&e21));
    }

    #[test]
    fn same_type_is_true() {
        assert!(TYPE_11.is(&TYPE_11.new("one")));
    }

    #[test]
    fn foreign_error_is_false() {
        let err = std::io::Error::other("one");
        assert!(!TYPE_11.is(&err));
    }

    #[test]
    fn wrapping_same_type_is_identity() {
        let err = TYPE_11.new("one");
        assert_eq!(TYPE_11.wrap(&err).to_string(), err.to_string());
    }

    #[test]
    fn wrapping_different_type_chains_messages() {
        let err = TYPE_11.new("one");
        let wrapped = TYPE_22.wrap(&err);

        assert_eq!(
            wrapped.to_string(),
            "error: code=2000, pkg=dummypackage2, msg=one | error: code=1000, pkg=dummypackage1, msg=one"
        );
        assert!(!TYPE_11.is(&wrapped));
        assert!(TYPE_22.is(&wrapped));
    }

    #[test]
    fn wrapping_foreign_error_uses_display() {
        let err = std::io::Error::other("disk gone");
        let wrapped = TYPE_11.wrap(&err);
        assert_eq!(wrapped.msg(), "disk gone");
        assert_eq!(wrapped.kind(), TYPE_11);
    }

    #[test]
    fn wrap_with_msg_replaces_message_for_same_type() {
        let err = TYPE_11.new("one");
        let wrapped = TYPE_11.wrap_with_msg(&err, "two");
        assert_eq!(wrapped.msg(), "two");
        assert_eq!(wrapped.kind(), TYPE_11);
    }

    #[test]
    fn wrap_with_msg_prefixes_different_type() {
        let err = TYPE_11.new("one");
        let wrapped = TYPE_22.wrap_with_msg(&err, "two");
        assert_eq!(
            wrapped.msg(),
            "two | error: code=1000, pkg=dummypackage1, msg=one"
        );
    }
}
