use thiserror::Error;

/// Every way lexing, parsing or rendering a template can fail.
///
/// All variants are fatal for the template or render that produced them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("lex error at offset {offset}: {message} (near `{snippet}`)")]
    Lex {
        offset: usize,
        message: String,
        snippet: String,
    },
    #[error("parse error at offset {offset}: {message} (near `{snippet}`)")]
    Parse {
        offset: usize,
        message: String,
        snippet: String,
    },
    #[error("unsupported option: {0}")]
    UnsupportedOption(&'static str),
    #[error("runtime error{}: {message}", at_offset(.offset))]
    Runtime {
        message: String,
        offset: Option<usize>,
    },
    #[error("template raised exception: {0}")]
    Raised(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("`{0}` used outside of a loop")]
    LoopControl(&'static str),
    #[error("call depth limit of {0} exceeded")]
    RecursionLimit(usize),
    #[error("invalid input document: {0}")]
    Input(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn at_offset(offset: &Option<usize>) -> String {
    match offset {
        Some(offset) => format!(" at offset {offset}"),
        None => String::new(),
    }
}

/// Up to 20 characters of `source` starting at `offset`, for diagnostics.
pub(crate) fn snippet(source: &str, offset: usize) -> String {
    let start = offset.min(source.len());
    let start = (0..=start)
        .rev()
        .find(|i| source.is_char_boundary(*i))
        .unwrap_or(0);
    source[start..].chars().take(20).collect()
}

impl Error {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            offset: None,
        }
    }

    /// Attach `offset` to a runtime error that does not carry one yet.
    pub(crate) fn at(self, at: usize) -> Self {
        match self {
            Error::Runtime {
                message,
                offset: None,
            } => Error::Runtime {
                message,
                offset: Some(at),
            },
            other => other,
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, Error::Lex { .. } | Error::Parse { .. })
    }
}
