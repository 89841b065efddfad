use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Archive unreadable as zip, or a required part is missing entirely.
    MalformedPackage(String),
    /// A specific part was requested by name and does not exist.
    PartNotFound(String),
    /// XML could not be parsed or re-serialized.
    Xml(String),
    /// The relationships part lacks the root element we append into.
    InvalidRelationships(String),
    /// Two fields share a name but disagree on prefix.
    AmbiguousField(String),
    /// The image collaborator failed to resolve a field's image reference.
    ImageFetch { field: String, reason: String },
    /// Image bytes whose format we cannot identify or size.
    UnsupportedImage(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::MalformedPackage(msg) => write!(f, "malformed package: {msg}"),
            Error::PartNotFound(path) => write!(f, "part not found: {path}"),
            Error::Xml(msg) => write!(f, "XML error: {msg}"),
            Error::InvalidRelationships(msg) => {
                write!(f, "invalid relationships structure: {msg}")
            }
            Error::AmbiguousField(name) => {
                write!(f, "field '{name}' appears with conflicting prefixes")
            }
            Error::ImageFetch { field, reason } => {
                write!(f, "failed to fetch image for field '{field}': {reason}")
            }
            Error::UnsupportedImage(msg) => write!(f, "unsupported image: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<roxmltree::Error> for Error {
    fn from(e: roxmltree::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}
