// This module defines the error types for agxc using the thiserror crate. A compilation
// can only fail in two ways: the shader uses a construct the backend recognises but does
// not support yet (Unimplemented), or the input breaks a precondition the optimization
// pipeline was supposed to establish (InvariantViolation). Both abort the compilation;
// there is no partial output. ParseError covers the source-IR text format.

//! Error types for the AGX backend.

use std::fmt;

use thiserror::Error;

use crate::ir::{AluOp, InterpMode, Stage};

/// Main error type for shader compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unimplemented: {construct}")]
    Unimplemented { construct: Unsupported },

    #[error("invalid {operation}: {reason}")]
    InvariantViolation {
        operation: &'static str,
        reason: String,
    },
}

impl CompileError {
    pub fn unimplemented(construct: Unsupported) -> Self {
        Self::Unimplemented { construct }
    }

    pub fn invariant(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            operation,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unimplemented { .. } => ErrorKind::Unimplemented,
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unimplemented,
    InvariantViolation,
}

/// Recognised source constructs the backend cannot translate yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    IndirectOffset,
    MultiComponentOutputStore,
    FlatVarying,
    InterpolationMode(InterpMode),
    MultipleRenderTargets { rt: u32 },
    DualSourceBlending,
    FragmentOutput { location: u32 },
    VertexAttributeLoad,
    Texture,
    Jump,
    IfStatement,
    Loop,
    MultiFunction,
    ShaderStage(Stage),
    AluOp(AluOp),
    Intrinsic(&'static str),
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndirectOffset => write!(f, "indirect I/O offsets"),
            Self::MultiComponentOutputStore => write!(f, "multi-component varying stores"),
            Self::FlatVarying => write!(f, "flat varyings"),
            Self::InterpolationMode(mode) => write!(f, "{mode:?} interpolation"),
            Self::MultipleRenderTargets { rt } => {
                write!(f, "multiple render targets (render target {rt})")
            }
            Self::DualSourceBlending => write!(f, "dual-source blending"),
            Self::FragmentOutput { location } => {
                write!(f, "fragment output at location {location}")
            }
            Self::VertexAttributeLoad => write!(f, "vertex attribute loads"),
            Self::Texture => write!(f, "texture instructions"),
            Self::Jump => write!(f, "jump instructions"),
            Self::IfStatement => write!(f, "if-statements"),
            Self::Loop => write!(f, "loops"),
            Self::MultiFunction => write!(f, "multi-function shaders"),
            Self::ShaderStage(stage) => write!(f, "{stage} shader stage"),
            Self::AluOp(op) => write!(f, "ALU op {}", op.name()),
            Self::Intrinsic(name) => write!(f, "intrinsic {name}"),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Error produced by the source-IR text parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}
