//! Error types for compilation and execution
//!
//! Compile errors render as `[line N] Error at 'lexeme': message`; runtime
//! errors render as the message followed by one `[line N] in name()` trace
//! line per live frame, innermost first.

use std::fmt;

/// Where in the token stream a compile error was reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAt {
    /// At a lexeme in the source
    Lexeme(String),
    /// At end of input
    End,
    /// No location suffix (scanner errors carry the message themselves)
    Bare,
}

/// A compile-time diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Source line
    pub line: u32,
    /// Location suffix
    pub at: ErrorAt,
    /// Diagnostic message
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.at {
            ErrorAt::Lexeme(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorAt::End => write!(f, " at end")?,
            ErrorAt::Bare => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// One stack-trace line of a runtime error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line of the instruction that was executing
    pub line: u32,
    /// Function name; `None` is the top-level script
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error with its stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// The formatted error message
    pub message: String,
    /// Stack trace, innermost frame first
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Result of `Vm::interpret`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretError {
    /// One or more compile errors; the program never ran
    Compile(Vec<CompileError>),
    /// The program compiled but failed at runtime
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                let mut first = true;
                for error in errors {
                    if !first {
                        writeln!(f)?;
                    }
                    write!(f, "{}", error)?;
                    first = false;
                }
                Ok(())
            }
            InterpretError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<RuntimeError> for InterpretError {
    fn from(error: RuntimeError) -> Self {
        InterpretError::Runtime(error)
    }
}

impl From<Vec<CompileError>> for InterpretError {
    fn from(errors: Vec<CompileError>) -> Self {
        InterpretError::Compile(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_compile_error_formats() {
        let at_lexeme = CompileError {
            line: 3,
            at: ErrorAt::Lexeme("var".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(
            at_lexeme.to_string(),
            "[line 3] Error at 'var': Expect expression."
        );

        let at_end = CompileError {
            line: 9,
            at: ErrorAt::End,
            message: "Expect ';' after value.".to_string(),
        };
        assert_eq!(at_end.to_string(), "[line 9] Error at end: Expect ';' after value.");
    }

    #[test]
    fn test_runtime_error_trace_format() {
        let error = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame {
                    line: 4,
                    name: Some("inner".to_string()),
                },
                TraceFrame { line: 9, name: None },
            ],
        };
        assert_eq!(
            error.to_string(),
            "Operands must be numbers.\n[line 4] in inner()\n[line 9] in script"
        );
    }
}
