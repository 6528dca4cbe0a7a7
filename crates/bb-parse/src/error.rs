use std::path::PathBuf;

/// Errors surfaced by the parsing core.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Grammar or structural violation, with the offending location.
    /// `lineno` 0 means the error is not tied to a single line.
    #[error("ParseError at {filename}:{lineno}: {msg}")]
    Syntax {
        msg: String,
        filename: PathBuf,
        lineno: u32,
    },

    /// The resolver exhausted every candidate. Attempts were still marked
    /// on the dependency record.
    #[error("file {name} not found in {search_path}")]
    NotFound { name: PathBuf, search_path: String },

    /// The resolved path exists but is not a regular file.
    #[error("{path} is not a regular file")]
    NotAFile { path: PathBuf },

    /// Signalled by evaluation to abandon the current recipe. `handle`
    /// absorbs it by flagging the datastore `__SKIPPED`.
    #[error("recipe skipped")]
    SkipRecipe,

    /// Structural ambiguity (e.g. a comment inside a line continuation).
    /// Aborts the parse session; callers must not resume after it.
    #[error("fatal: {msg}")]
    Fatal { msg: String },

    /// Include/inherit recursion exceeded the session's depth limit.
    #[error("include depth {depth} exceeded, include cycle suspected while parsing {filename}")]
    IncludeDepth { depth: usize, filename: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub(crate) fn syntax(
        msg: impl Into<String>,
        filename: impl Into<PathBuf>,
        lineno: u32,
    ) -> ParseError {
        ParseError::Syntax {
            msg: msg.into(),
            filename: filename.into(),
            lineno,
        }
    }

    pub(crate) fn fatal(msg: impl Into<String>) -> ParseError {
        ParseError::Fatal { msg: msg.into() }
    }

    /// True for the kinds a non-required include swallows (the target did
    /// not exist).
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            ParseError::NotFound { .. } => true,
            ParseError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
