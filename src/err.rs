use std::path::{Path, PathBuf};
use std::{error, fmt, io};

#[derive(Debug)]
pub enum Error {
    File {
        op: String,
        name: PathBuf,
        io: io::Error,
    },
    OS {
        op: String,
        io: io::Error,
    },
    TooLong,
    NotIPv4,
    BadStr,
    UIDMap,
    ParseError {
        msg: String,
        name: PathBuf,
    },
    MissingMount,
    /// A `desired` id range is not covered by any allocated sub-id range.
    UnmappedId { inner: u32, outer: u32, length: u32 },
    /// Total length mismatch between `desired` and its projection.
    IdCountMismatch,
    /// id_map text would overflow the kernel's write buffer.
    IdMapOverflow,
    /// Two id ranges overlap in their sort key after normalization.
    OverlappingRange,
    /// Too many distinct ranges for a single id_map write.
    TooManyRanges,
    /// The outer helper exited (or was killed) before acknowledging.
    HelperDied,
    /// fd-passing primitive received a malformed or absent ancillary message.
    NoFdReceived,
    Annotated(AnnotatedError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Annotate I/O error
    pub fn file<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P, err: io::Error) -> Self {
        Error::File {
            op: desc.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_file_error<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P) -> Self {
        Self::file(desc, path, io::Error::last_os_error())
    }

    pub fn os<S: AsRef<str>>(desc: S, err: io::Error) -> Self {
        Self::OS {
            op: desc.as_ref().to_string(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_os_error<S: AsRef<str>>(desc: S) -> Self {
        Self::os(desc, io::Error::last_os_error())
    }

    pub fn parse<M: AsRef<str>, P: AsRef<Path>>(msg: M, path: P) -> Self {
        Self::ParseError {
            msg: msg.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
        }
    }

    /// True if this error ultimately wraps an `io::Error` of the given kind.
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        match self {
            Self::File { io, .. } => io.kind() == kind,
            Self::OS { io, .. } => io.kind() == kind,
            Self::Annotated(a) => a.is_io_error(kind),
            _ => false,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::File { io, .. } => Some(io),
            Self::OS { io, .. } => Some(io),
            Self::Annotated(a) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { op, name, io } => {
                write!(f, "File {} with {} : {}", op, name.display(), io)
            }
            Self::OS { op, io } => write!(f, "OS {} : {}", op, io),
            Self::TooLong => write!(f, "Interface name too long"),
            Self::NotIPv4 => write!(f, "Interface address not IPv4"),
            Self::BadStr => write!(f, "String can not contain nil"),
            Self::UIDMap => write!(f, "newuidmap"),
            Self::ParseError { msg, name } => {
                write!(f, "Error: {} while parsing {}", msg, name.display())
            }
            Self::MissingMount => write!(f, "Missing mount point info"),
            Self::UnmappedId {
                inner,
                outer,
                length,
            } => write!(
                f,
                "cannot map desired range inner={} outer={} length={}: not covered by any allocated sub-id range",
                inner, outer, length
            ),
            Self::IdCountMismatch => write!(f, "projected id count does not match desired id count"),
            Self::IdMapOverflow => write!(f, "id_map text exceeds kernel write buffer"),
            Self::OverlappingRange => write!(f, "id ranges overlap after normalization"),
            Self::TooManyRanges => write!(f, "too many id ranges for a single mapping"),
            Self::HelperDied => write!(f, "outer helper exited before acknowledging"),
            Self::NoFdReceived => write!(f, "no file descriptor received on control socket"),
            Self::Annotated(a) => write!(f, "{}", a),
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_inp: std::ffi::NulError) -> Self {
        Error::BadStr
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(_inp: std::num::ParseIntError) -> Self {
        Error::BadStr
    }
}

impl From<AnnotatedError> for Error {
    fn from(a: AnnotatedError) -> Self {
        Error::Annotated(a)
    }
}

/// An underlying error plus a human-readable note about what was being attempted.
///
/// Used at call sites (`exec()`, path-prefix checks, ...) where the source
/// error type doesn't carry enough context on its own.
#[derive(Debug)]
pub struct AnnotatedError {
    msg: String,
    io: Option<io::Error>,
    source: Option<Box<dyn error::Error + Send + Sync + 'static>>,
}

impl AnnotatedError {
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        self.io.as_ref().map(|e| e.kind() == kind).unwrap_or(false)
    }
}

impl fmt::Display for AnnotatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(io) = &self.io {
            write!(f, "{}: {}", self.msg, io)
        } else if let Some(src) = &self.source {
            write!(f, "{}: {}", self.msg, src)
        } else {
            write!(f, "{}", self.msg)
        }
    }
}

impl error::Error for AnnotatedError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        if let Some(io) = &self.io {
            Some(io)
        } else if let Some(src) = &self.source {
            Some(src.as_ref())
        } else {
            None
        }
    }
}

/// Attach context to an error (or an `io::Error` directly) without losing the original.
pub trait Annotatable {
    type Output;
    fn annotate<S: AsRef<str>>(self, msg: S) -> Self::Output;
}

impl Annotatable for io::Error {
    type Output = AnnotatedError;
    fn annotate<S: AsRef<str>>(self, msg: S) -> AnnotatedError {
        AnnotatedError {
            msg: msg.as_ref().to_string(),
            io: Some(self),
            source: None,
        }
    }
}

impl<T, E> Annotatable for std::result::Result<T, E>
where
    E: error::Error + Send + Sync + 'static,
{
    type Output = std::result::Result<T, AnnotatedError>;
    fn annotate<S: AsRef<str>>(self, msg: S) -> Self::Output {
        self.map_err(|e| AnnotatedError {
            msg: msg.as_ref().to_string(),
            io: None,
            source: Some(Box::new(e)),
        })
    }
}
