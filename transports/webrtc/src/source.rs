//! Media source descriptor consumed by the bridge
//!
//! The descriptor is the declarative form of an FFmpeg input: the
//! arguments that select and decode the source, plus optional stream
//! options describing which tracks the source carries.

use serde::{Deserialize, Deserializer, Serialize};

/// FFmpeg input description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    /// Decoder invocation arguments, inserted verbatim after the global flags
    pub input_arguments: Vec<String>,

    /// Optional stream options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_stream_options: Option<MediaStreamOptions>,
}

/// Track options attached to a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStreamOptions {
    /// Audio options: absent means unknown, `null` means the source has no audio
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio: Option<Option<serde_json::Value>>,

    /// Any other options are carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<serde_json::Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<serde_json::Value>::deserialize(deserializer).map(Some)
}

impl SourceDescriptor {
    /// Descriptor from plain input arguments
    pub fn new<I, S>(input_arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            input_arguments: input_arguments.into_iter().map(Into::into).collect(),
            media_stream_options: None,
        }
    }

    /// Mark the source as carrying no audio track
    pub fn without_audio(mut self) -> Self {
        let options = self.media_stream_options.get_or_insert_with(Default::default);
        options.audio = Some(None);
        self
    }

    /// Parse a descriptor from its JSON form
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the source is explicitly declared to have no audio
    ///
    /// Only an explicit `mediaStreamOptions.audio: null` counts. A missing
    /// options object or a missing `audio` member both mean audio is
    /// expected, and a silent track is synthesized if the input lacks one.
    pub fn has_no_audio(&self) -> bool {
        matches!(
            self.media_stream_options,
            Some(MediaStreamOptions {
                audio: Some(None),
                ..
            })
        )
    }

    /// Whether an audio track is expected
    pub fn expects_audio(&self) -> bool {
        !self.has_no_audio()
    }
}
