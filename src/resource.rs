//! Resource model: the closed set of negotiable hardware resources.
//!
//! A [`Resource`] is a tagged variant over [`ResourceType`]: every
//! resource carries the shared `optional` flag, and the audio and video
//! variants carry their classification attributes on top. Identity
//! inside a resource set is the type alone.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hardware resource types known to the policy authority.
///
/// Ordinals are part of the wire contract. Never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResourceType {
    AudioPlayback = 0,
    VideoPlayback = 1,
    AudioRecorder = 2,
    VideoRecorder = 3,
    Vibra = 4,
    Leds = 5,
    Backlight = 6,
    SystemButton = 7,
    LockButton = 8,
    ScaleButton = 9,
    SnapButton = 10,
    LensCover = 11,
    HeadsetButtons = 12,
    RearFlashlight = 13,
}

/// Number of resource types.
pub const NUMBER_OF_TYPES: usize = 14;

impl ResourceType {
    /// Every type, in ordinal order.
    pub const ALL: [ResourceType; NUMBER_OF_TYPES] = [
        ResourceType::AudioPlayback,
        ResourceType::VideoPlayback,
        ResourceType::AudioRecorder,
        ResourceType::VideoRecorder,
        ResourceType::Vibra,
        ResourceType::Leds,
        ResourceType::Backlight,
        ResourceType::SystemButton,
        ResourceType::LockButton,
        ResourceType::ScaleButton,
        ResourceType::SnapButton,
        ResourceType::LensCover,
        ResourceType::HeadsetButtons,
        ResourceType::RearFlashlight,
    ];

    /// Stable wire ordinal.
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Kebab-case name used on the command line and in logs.
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::AudioPlayback => "audio-playback",
            ResourceType::VideoPlayback => "video-playback",
            ResourceType::AudioRecorder => "audio-recorder",
            ResourceType::VideoRecorder => "video-recorder",
            ResourceType::Vibra => "vibra",
            ResourceType::Leds => "leds",
            ResourceType::Backlight => "backlight",
            ResourceType::SystemButton => "system-button",
            ResourceType::LockButton => "lock-button",
            ResourceType::ScaleButton => "scale-button",
            ResourceType::SnapButton => "snap-button",
            ResourceType::LensCover => "lens-cover",
            ResourceType::HeadsetButtons => "headset-buttons",
            ResourceType::RearFlashlight => "rear-flashlight",
        }
    }
}

impl From<ResourceType> for u32 {
    fn from(kind: ResourceType) -> Self {
        kind.ordinal()
    }
}

/// Ordinal or name that does not map to a [`ResourceType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnknownResourceType {
    #[error("unknown resource type ordinal {0}")]
    Ordinal(u32),
    #[error("unknown resource type {0:?}")]
    Name(String),
}

impl TryFrom<u32> for ResourceType {
    type Error = UnknownResourceType;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|i| ResourceType::ALL.get(i).copied())
            .ok_or(UnknownResourceType::Ordinal(value))
    }
}

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownResourceType::Name(s.to_string()))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream tag used by the policy to identify an audio stream,
/// e.g. `media.name` = `teststream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTag {
    pub name: String,
    pub value: String,
}

/// Classification attributes of the audio variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioAttributes {
    audio_group: Option<String>,
    process_id: Option<u32>,
    stream_tag: Option<StreamTag>,
}

impl AudioAttributes {
    pub fn audio_group(&self) -> Option<&str> {
        self.audio_group.as_deref()
    }

    pub fn audio_group_is_set(&self) -> bool {
        self.audio_group.is_some()
    }

    pub fn set_audio_group(&mut self, group: impl Into<String>) {
        self.audio_group = Some(group.into());
    }

    /// PID of the process rendering the audio stream.
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn set_process_id(&mut self, pid: u32) {
        self.process_id = Some(pid);
    }

    pub fn stream_tag(&self) -> Option<&StreamTag> {
        self.stream_tag.as_ref()
    }

    pub fn stream_tag_is_set(&self) -> bool {
        self.stream_tag.is_some()
    }

    pub fn set_stream_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.stream_tag = Some(StreamTag {
            name: name.into(),
            value: value.into(),
        });
    }
}

/// Attributes of the video variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoAttributes {
    process_id: Option<u32>,
}

impl VideoAttributes {
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn set_process_id(&mut self, pid: u32) {
        self.process_id = Some(pid);
    }
}

/// Per-type payload. Private so a resource's type and its attributes
/// can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Variant {
    AudioPlayback(AudioAttributes),
    AudioRecorder(AudioAttributes),
    VideoPlayback(VideoAttributes),
    VideoRecorder(VideoAttributes),
    Plain(ResourceType),
}

/// A single requested hardware resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    optional: bool,
    variant: Variant,
}

impl Resource {
    /// Create a mandatory resource of the given type with no attributes set.
    pub fn new(kind: ResourceType) -> Self {
        let variant = match kind {
            ResourceType::AudioPlayback => Variant::AudioPlayback(AudioAttributes::default()),
            ResourceType::AudioRecorder => Variant::AudioRecorder(AudioAttributes::default()),
            ResourceType::VideoPlayback => Variant::VideoPlayback(VideoAttributes::default()),
            ResourceType::VideoRecorder => Variant::VideoRecorder(VideoAttributes::default()),
            other => Variant::Plain(other),
        };
        Self {
            optional: false,
            variant,
        }
    }

    /// Audio playback resource in the given audio group.
    pub fn audio_playback(group: impl Into<String>) -> Self {
        let mut resource = Self::new(ResourceType::AudioPlayback);
        if let Some(audio) = resource.audio_mut() {
            audio.set_audio_group(group);
        }
        resource
    }

    pub fn kind(&self) -> ResourceType {
        match &self.variant {
            Variant::AudioPlayback(_) => ResourceType::AudioPlayback,
            Variant::AudioRecorder(_) => ResourceType::AudioRecorder,
            Variant::VideoPlayback(_) => ResourceType::VideoPlayback,
            Variant::VideoRecorder(_) => ResourceType::VideoRecorder,
            Variant::Plain(kind) => *kind,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn set_optional(&mut self, optional: bool) {
        self.optional = optional;
    }

    /// Builder-style [`set_optional`](Self::set_optional).
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Audio attributes, for the audio playback and recorder types.
    pub fn audio(&self) -> Option<&AudioAttributes> {
        match &self.variant {
            Variant::AudioPlayback(a) | Variant::AudioRecorder(a) => Some(a),
            _ => None,
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioAttributes> {
        match &mut self.variant {
            Variant::AudioPlayback(a) | Variant::AudioRecorder(a) => Some(a),
            _ => None,
        }
    }

    /// Video attributes, for the video playback and recorder types.
    pub fn video(&self) -> Option<&VideoAttributes> {
        match &self.variant {
            Variant::VideoPlayback(v) | Variant::VideoRecorder(v) => Some(v),
            _ => None,
        }
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoAttributes> {
        match &mut self.variant {
            Variant::VideoPlayback(v) | Variant::VideoRecorder(v) => Some(v),
            _ => None,
        }
    }

    /// PID attached to the resource, whichever variant carries one.
    pub fn process_id(&self) -> Option<u32> {
        match &self.variant {
            Variant::AudioPlayback(a) | Variant::AudioRecorder(a) => a.process_id(),
            Variant::VideoPlayback(v) | Variant::VideoRecorder(v) => v.process_id(),
            Variant::Plain(_) => None,
        }
    }
}

impl From<ResourceType> for Resource {
    fn from(kind: ResourceType) -> Self {
        Resource::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        for (i, kind) in ResourceType::ALL.iter().enumerate() {
            assert_eq!(kind.ordinal() as usize, i);
        }
        assert_eq!(ResourceType::AudioPlayback.ordinal(), 0);
        assert_eq!(ResourceType::RearFlashlight.ordinal(), 13);
    }

    #[test]
    fn try_from_unknown_ordinal() {
        assert_eq!(
            ResourceType::try_from(14),
            Err(UnknownResourceType::Ordinal(14))
        );
        assert_eq!(ResourceType::try_from(5), Ok(ResourceType::Leds));
    }

    #[test]
    fn names_parse_back() {
        for kind in ResourceType::ALL {
            assert_eq!(kind.name().parse::<ResourceType>(), Ok(kind));
        }
        assert!("speaker".parse::<ResourceType>().is_err());
    }

    #[test]
    fn serialized_as_ordinal() {
        let encoded = rmp_serde::to_vec(&ResourceType::LensCover).unwrap();
        let ordinal: u32 = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(ordinal, 11);

        let bad = rmp_serde::to_vec(&99u32).unwrap();
        assert!(rmp_serde::from_slice::<ResourceType>(&bad).is_err());
    }

    #[test]
    fn new_resource_matches_type() {
        for kind in ResourceType::ALL {
            let resource = Resource::new(kind);
            assert_eq!(resource.kind(), kind);
            assert!(!resource.is_optional());
        }
    }

    #[test]
    fn audio_attributes_start_unset() {
        let resource = Resource::new(ResourceType::AudioPlayback);
        let audio = resource.audio().unwrap();
        assert!(!audio.audio_group_is_set());
        assert!(!audio.stream_tag_is_set());
        assert_eq!(audio.process_id(), None);
    }

    #[test]
    fn audio_setters() {
        let mut resource = Resource::audio_playback("player");
        let audio = resource.audio_mut().unwrap();
        audio.set_process_id(1234);
        audio.set_stream_tag("media.name", "teststream");

        let audio = resource.audio().unwrap();
        assert_eq!(audio.audio_group(), Some("player"));
        assert_eq!(audio.process_id(), Some(1234));
        assert_eq!(
            audio.stream_tag(),
            Some(&StreamTag {
                name: "media.name".into(),
                value: "teststream".into(),
            })
        );
        assert_eq!(resource.process_id(), Some(1234));
    }

    #[test]
    fn video_pid() {
        let mut resource = Resource::new(ResourceType::VideoPlayback);
        resource.video_mut().unwrap().set_process_id(1234);
        assert_eq!(resource.process_id(), Some(1234));
        assert!(resource.audio().is_none());
    }

    #[test]
    fn plain_types_have_no_attributes() {
        let mut resource = Resource::new(ResourceType::Vibra);
        assert!(resource.audio_mut().is_none());
        assert!(resource.video_mut().is_none());
        assert_eq!(resource.process_id(), None);
    }
}
