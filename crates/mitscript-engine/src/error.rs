//! Error kinds surfaced by the engine
//!
//! Every kind is printed to the user as `Kind: message`, which is exactly
//! what `Display` renders here. All errors are fatal to the running program;
//! there is no user-visible recovery.

/// Engine-wide error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A value of the wrong tag or heap class was used.
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Read of a variable with no assignment yet, or an unknown name at
    /// compile time.
    #[error("UninitializedVariable: {0}")]
    UninitializedVariable(String),

    /// Division by zero.
    #[error("ArithmeticError: {0}")]
    ArithmeticError(String),

    /// Catch-all for allocator and internal invariant violations.
    #[error("RuntimeError: {0}")]
    RuntimeError(String),

    /// Operand-stack underflow in the bytecode interpreter; indicates
    /// miscompiled bytecode.
    #[error("InsufficientStack: {0}")]
    InsufficientStack(String),

    /// Source text or textual bytecode that does not parse.
    #[error("ParseError: {0}")]
    ParseError(String),
}

impl Error {
    /// Shorthand used by cast failures all over the VM.
    pub fn type_error(expected: &str, got: &str) -> Error {
        Error::TypeError(format!("expected {expected}, got {got}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_has_kind_prefix() {
        let e = Error::TypeError("expected integer, got string".to_string());
        assert_eq!(e.to_string(), "TypeError: expected integer, got string");

        let e = Error::ArithmeticError("cannot divide by 0".to_string());
        assert_eq!(e.to_string(), "ArithmeticError: cannot divide by 0");
    }

    #[test]
    fn test_type_error_helper() {
        let e = Error::type_error("record", "integer");
        assert_eq!(e.to_string(), "TypeError: expected record, got integer");
    }
}
