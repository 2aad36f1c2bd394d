use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodegenError>;

/// Fatal errors surfaced by module generation. All of them end the run;
/// the caller may retry the whole compile, the generator never does.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("out of memory during module code generation")]
    OutOfMemory,

    #[error("module code exceeds the maximum code-segment size")]
    CodeTooLarge,

    #[error("compile error: {0}")]
    Compile(String),

    #[error("module compilation was cancelled")]
    Cancelled,
}

impl From<kestrel_masm::MasmError> for CodegenError {
    fn from(err: kestrel_masm::MasmError) -> Self {
        match err {
            kestrel_masm::MasmError::OutOfMemory => CodegenError::OutOfMemory,
            kestrel_masm::MasmError::CodeTooLarge => CodegenError::CodeTooLarge,
        }
    }
}
