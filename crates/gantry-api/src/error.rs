use std::{borrow::Cow, fmt::Write as _};

/// An error validating a Gantry API type.
///
/// Errors carry a message about what went wrong and a jsonpath style path to
/// the field that caused the problem, so an invalid IR names the exact route
/// or listener that failed validation.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
pub struct Error {
    message: String,

    // the reversed path to the offending field. the leaf is path[0] and the
    // root is at the end. see ErrorContext for how this gets built.
    path: Vec<PathEntry>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.path.is_empty() {
            write!(f, "{}: ", self.path())?;
        }

        f.write_str(&self.message)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Error")
            .field("message", &self.message)
            .field("path", &self.path())
            .finish()
    }
}

impl Error {
    /// The path to the field that failed validation, rendered from the root.
    pub fn path(&self) -> String {
        path_str(self.path.iter().rev())
    }

    /// The error message without any path context.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn new_static(message: &'static str) -> Self {
        Self {
            message: message.to_string(),
            path: vec![],
        }
    }

    pub(crate) fn new(message: String) -> Self {
        Self {
            message,
            path: vec![],
        }
    }

    pub(crate) fn with_field(mut self, field: &'static str) -> Self {
        self.path.push(PathEntry::from(field));
        self
    }

    pub(crate) fn with_index(mut self, index: usize) -> Self {
        self.path.push(PathEntry::Index(index));
        self
    }
}

fn path_str<'a, I>(path: I) -> String
where
    I: IntoIterator<Item = &'a PathEntry>,
{
    let mut buf = String::with_capacity(16);

    for (i, path_entry) in path.into_iter().enumerate() {
        if i > 0 && path_entry.is_field() {
            buf.push('.');
        }
        let _ = write!(&mut buf, "{}", path_entry);
    }

    buf
}

/// Add field-path context to an error. Context is added at the callsite, so
/// each validating function adds its own fields and the path ends up in
/// root-to-leaf order.
pub(crate) trait ErrorContext<T>: Sized {
    fn with_field(self, field: &'static str) -> Result<T, Error>;
    fn with_index(self, index: usize) -> Result<T, Error>;

    /// Shorthand for `with_index(idx).with_field(name)`.
    fn with_field_index(self, field: &'static str, index: usize) -> Result<T, Error> {
        self.with_index(index).with_field(field)
    }
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn with_field(self, field: &'static str) -> Result<T, Error> {
        self.map_err(|e| e.with_field(field))
    }

    fn with_index(self, index: usize) -> Result<T, Error> {
        self.map_err(|e| e.with_index(index))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum PathEntry {
    Field(Cow<'static, str>),
    Index(usize),
}

impl PathEntry {
    fn is_field(&self) -> bool {
        matches!(self, PathEntry::Field(_))
    }
}

impl std::fmt::Display for PathEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathEntry::Field(field) => f.write_str(field),
            PathEntry::Index(idx) => f.write_fmt(format_args!("[{idx}]")),
        }
    }
}

impl From<&'static str> for PathEntry {
    fn from(value: &'static str) -> Self {
        PathEntry::Field(Cow::Borrowed(value))
    }
}
