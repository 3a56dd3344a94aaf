use crate::ast::Location;

pub type BloxResult<T> = std::result::Result<T, BloxError>;

/// Result of evaluating or rendering; deferred values settle to one of these.
pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// A fatal, non-recoverable error raised while parsing template source.
///
/// The location is never before the last character the parser successfully
/// consumed.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParseError {
    pub message: String,
    pub location: Location,
}

impl ParseError {
    pub fn new<M: Into<String>>(message: M, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.location.source
    }

    pub const fn line(&self) -> usize {
        self.location.line
    }

    pub const fn column(&self) -> usize {
        self.location.column
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error at {}: {}", self.location, self.message)
    }
}

impl std::error::Error for ParseError {}

/// An error raised while rendering; fatal to the render call that hit it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderError {
    pub message: String,
    pub location: Option<Location>,
}

impl RenderError {
    pub fn new<M: Into<String>>(message: M, location: Location) -> Self {
        Self {
            message: message.into(),
            location: Some(location),
        }
    }

    /// A render error raised by host code or a collaborator with no template
    /// position to point at.
    pub fn unlocated<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "Render error at {}: {}", location, self.message),
            None => write!(f, "Render error: {}", self.message),
        }
    }
}

impl std::error::Error for RenderError {}

/// Source handed to `render` as text may fail to parse; the failure is
/// reported through the render result.
impl From<ParseError> for RenderError {
    fn from(error: ParseError) -> Self {
        Self {
            message: error.message,
            location: Some(error.location),
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BloxError {
    TemplateExists { template_name: String },
    MissingTemplate { template_name: String },
    Io { path: String, message: String },
    Parse(ParseError),
    Render(RenderError),
}

impl BloxError {
    /// Shorthand for an unlocated render failure.
    pub fn render<M: Into<String>>(message: M) -> Self {
        Self::Render(RenderError::unlocated(message))
    }
}

impl std::fmt::Display for BloxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TemplateExists { template_name } => {
                write!(f, "Template already exists: {}", template_name)
            }
            Self::MissingTemplate { template_name } => {
                write!(f, "Template not found: {}", template_name)
            }
            Self::Io { path, message } => {
                write!(f, "Could not read {}: {}", path, message)
            }
            Self::Parse(parse_error) => write!(f, "{}", parse_error),
            Self::Render(render_error) => write!(f, "{}", render_error),
        }
    }
}

impl std::error::Error for BloxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(parse_error) => Some(parse_error),
            Self::Render(render_error) => Some(render_error),
            Self::TemplateExists { .. } | Self::MissingTemplate { .. } | Self::Io { .. } => None,
        }
    }
}

impl From<ParseError> for BloxError {
    fn from(error: ParseError) -> Self {
        Self::Parse(error)
    }
}

impl From<RenderError> for BloxError {
    fn from(error: RenderError) -> Self {
        Self::Render(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_parse_error_display_includes_position() {
        let err = ParseError::new("Unexpected closing tag", Location::new("page.blx", 3, 7));
        assert_eq!(
            err.to_string(),
            "Parse error at page.blx:3:7: Unexpected closing tag"
        );
        assert_eq!(err.line(), 3);
        assert_eq!(err.column(), 7);
        assert_eq!(err.source_name(), "page.blx");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blox_error_source_chain() {
        let err: BloxError = RenderError::unlocated("boom").into();
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Render error: boom");

        let err = BloxError::MissingTemplate {
            template_name: "home".to_string(),
        };
        assert!(std::error::Error::source(&err).is_none());
    }
}
