use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Merge,
    Encode,
    Trim,
    Sample,
    MediaInfo,
    Watermark,
    Convert,
    Rename,
    Rotate,
    Flip,
    Speed,
    Volume,
    Crop,
    Gif,
    Reverse,
    Extract,
    ExtractThumb,
}

impl ToolKind {
    pub const ALL: [ToolKind; 17] = [
        ToolKind::Merge,
        ToolKind::Encode,
        ToolKind::Trim,
        ToolKind::Sample,
        ToolKind::MediaInfo,
        ToolKind::Watermark,
        ToolKind::Convert,
        ToolKind::Rename,
        ToolKind::Rotate,
        ToolKind::Flip,
        ToolKind::Speed,
        ToolKind::Volume,
        ToolKind::Crop,
        ToolKind::Gif,
        ToolKind::Reverse,
        ToolKind::Extract,
        ToolKind::ExtractThumb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Encode => "encode",
            Self::Trim => "trim",
            Self::Sample => "sample",
            Self::MediaInfo => "mediainfo",
            Self::Watermark => "watermark",
            Self::Convert => "convert",
            Self::Rename => "rename",
            Self::Rotate => "rotate",
            Self::Flip => "flip",
            Self::Speed => "speed",
            Self::Volume => "volume",
            Self::Crop => "crop",
            Self::Gif => "gif",
            Self::Reverse => "reverse",
            Self::Extract => "extract",
            Self::ExtractThumb => "extract_thumb",
        }
    }

    /// Minimum number of inputs a task for this tool consumes.
    pub fn min_inputs(self) -> usize {
        match self {
            Self::Merge => 2,
            _ => 1,
        }
    }
}

impl Display for ToolKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    VideoVideo,
    VideoAudio,
    VideoSubtitle,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    pub resolution: Option<String>,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub suffix: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplePoint {
    Start,
    Middle,
    End,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatermarkKind {
    None,
    Text { text: String },
    Image { image_id: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GifQuality {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    Video,
    Audio,
    Subtitles,
    Thumbnails,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailMode {
    Single,
    Interval,
}

/// Tool selection together with the settings payload its command builder needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolSettings {
    Merge {
        mode: MergeMode,
    },
    Encode(EncodeSettings),
    Trim {
        start: String,
        end: String,
    },
    Sample {
        duration_secs: u32,
        from: SamplePoint,
    },
    MediaInfo,
    Watermark {
        kind: WatermarkKind,
        position: WatermarkPosition,
        opacity: f32,
    },
    Convert {
        container: String,
    },
    Rename {
        file_name: String,
    },
    Rotate {
        angle: u16,
    },
    Flip {
        direction: FlipDirection,
    },
    Speed {
        factor: f32,
    },
    Volume {
        percent: u16,
    },
    Crop {
        aspect_ratio: String,
    },
    Gif {
        fps: u8,
        scale: u32,
        quality: GifQuality,
    },
    Reverse,
    Extract {
        mode: ExtractMode,
    },
    ExtractThumb {
        mode: ThumbnailMode,
        timestamp: String,
        count: u16,
    },
}

impl ToolSettings {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Merge { .. } => ToolKind::Merge,
            Self::Encode(_) => ToolKind::Encode,
            Self::Trim { .. } => ToolKind::Trim,
            Self::Sample { .. } => ToolKind::Sample,
            Self::MediaInfo => ToolKind::MediaInfo,
            Self::Watermark { .. } => ToolKind::Watermark,
            Self::Convert { .. } => ToolKind::Convert,
            Self::Rename { .. } => ToolKind::Rename,
            Self::Rotate { .. } => ToolKind::Rotate,
            Self::Flip { .. } => ToolKind::Flip,
            Self::Speed { .. } => ToolKind::Speed,
            Self::Volume { .. } => ToolKind::Volume,
            Self::Crop { .. } => ToolKind::Crop,
            Self::Gif { .. } => ToolKind::Gif,
            Self::Reverse => ToolKind::Reverse,
            Self::Extract { .. } => ToolKind::Extract,
            Self::ExtractThumb { .. } => ToolKind::ExtractThumb,
        }
    }

    pub fn defaults(kind: ToolKind) -> Self {
        match kind {
            ToolKind::Merge => Self::Merge {
                mode: MergeMode::VideoVideo,
            },
            ToolKind::Encode => Self::Encode(EncodeSettings {
                video_codec: "libx264".to_string(),
                crf: 23,
                preset: "medium".to_string(),
                resolution: None,
                audio_codec: "aac".to_string(),
                audio_bitrate: "128k".to_string(),
                suffix: "[ENC]".to_string(),
            }),
            ToolKind::Trim => Self::Trim {
                start: "00:00:00".to_string(),
                end: "00:00:30".to_string(),
            },
            ToolKind::Sample => Self::Sample {
                duration_secs: 30,
                from: SamplePoint::Start,
            },
            ToolKind::MediaInfo => Self::MediaInfo,
            ToolKind::Watermark => Self::Watermark {
                kind: WatermarkKind::None,
                position: WatermarkPosition::BottomRight,
                opacity: 0.7,
            },
            ToolKind::Convert => Self::Convert {
                container: "mp4".to_string(),
            },
            ToolKind::Rename => Self::Rename {
                file_name: "output".to_string(),
            },
            ToolKind::Rotate => Self::Rotate { angle: 90 },
            ToolKind::Flip => Self::Flip {
                direction: FlipDirection::Horizontal,
            },
            ToolKind::Speed => Self::Speed { factor: 1.0 },
            ToolKind::Volume => Self::Volume { percent: 100 },
            ToolKind::Crop => Self::Crop {
                aspect_ratio: "16:9".to_string(),
            },
            ToolKind::Gif => Self::Gif {
                fps: 10,
                scale: 480,
                quality: GifQuality::Medium,
            },
            ToolKind::Reverse => Self::Reverse,
            ToolKind::Extract => Self::Extract {
                mode: ExtractMode::Video,
            },
            ToolKind::ExtractThumb => Self::ExtractThumb {
                mode: ThumbnailMode::Single,
                timestamp: "00:00:05".to_string(),
                count: 5,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ToolKind, ToolSettings};

    #[test]
    fn defaults_match_their_kind() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolSettings::defaults(kind).kind(), kind);
        }
    }

    #[test]
    fn tool_names_parse_back() {
        assert_eq!("extract_thumb".parse::<ToolKind>(), Ok(ToolKind::ExtractThumb));
        assert_eq!("mediainfo".parse::<ToolKind>(), Ok(ToolKind::MediaInfo));
        assert!("transcode".parse::<ToolKind>().is_err());
    }

    #[test]
    fn only_merge_needs_a_batch() {
        assert_eq!(ToolKind::Merge.min_inputs(), 2);
        assert_eq!(ToolKind::Trim.min_inputs(), 1);
    }
}
