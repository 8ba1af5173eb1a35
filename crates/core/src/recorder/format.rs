use crate::error::RecordingError;

/// A container/codec combination the encoder can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingFormat {
    pub mime_type: String,
    pub extension: String,
}

impl RecordingFormat {
    pub fn new(mime_type: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            extension: extension.into(),
        }
    }

    /// Container part of the mime type, without codec parameters.
    pub fn container(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or(&self.mime_type)
            .trim()
    }

    /// Codecs named in the mime type's `codecs=` parameter, if any.
    pub fn codecs(&self) -> Vec<&str> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|p| p.trim().strip_prefix("codecs="))
            .flat_map(|list| list.trim_matches('"').split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }
}

impl std::fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.mime_type)
    }
}

/// The preferred format followed by the two broad fallbacks.
pub fn default_preferences() -> Vec<RecordingFormat> {
    vec![
        RecordingFormat::new("video/webm;codecs=vp9,opus", "webm"),
        RecordingFormat::new("video/webm", "webm"),
        RecordingFormat::new("video/mp4", "mp4"),
    ]
}

/// Picks the first format in preference order that `supported` accepts.
pub fn negotiate(
    preferences: &[RecordingFormat],
    supported: impl Fn(&RecordingFormat) -> bool,
) -> Result<RecordingFormat, RecordingError> {
    preferences
        .iter()
        .find(|f| supported(f))
        .cloned()
        .ok_or_else(|| {
            RecordingError::UnsupportedFormat(
                preferences.iter().map(|f| f.mime_type.clone()).collect(),
            )
        })
}
