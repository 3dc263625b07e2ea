use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Where a task's input comes from. Only the download collaborator interprets it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputSource {
    Url(String),
    ChatFile {
        file_id: String,
        file_name: Option<String>,
        file_size: Option<u64>,
    },
    LocalPath(PathBuf),
    Batch(Vec<InputSource>),
}

impl InputSource {
    /// Number of files this descriptor expands to once downloaded.
    pub fn item_count(&self) -> usize {
        match self {
            Self::Batch(items) => items.iter().map(InputSource::item_count).sum(),
            _ => 1,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::ChatFile {
                file_id, file_name, ..
            } => file_name.clone().unwrap_or_else(|| file_id.clone()),
            Self::LocalPath(path) => path.display().to_string(),
            Self::Batch(items) => format!("batch of {}", items.len()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UploadSettings {
    pub target: String,
    pub file_name: Option<String>,
}

impl UploadSettings {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            file_name: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// One staged input in a user's batch queue.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub descriptor: InputSource,
    pub added_at: SystemTime,
}

impl QueueItem {
    pub fn new(descriptor: InputSource) -> Self {
        Self {
            descriptor,
            added_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::InputSource;

    #[test]
    fn batch_counts_nested_items() {
        let source = InputSource::Batch(vec![
            InputSource::Url("https://example.com/a.mkv".to_string()),
            InputSource::Batch(vec![
                InputSource::LocalPath(PathBuf::from("/tmp/b.mkv")),
                InputSource::LocalPath(PathBuf::from("/tmp/c.mkv")),
            ]),
        ]);
        assert_eq!(source.item_count(), 3);
    }

    #[test]
    fn input_source_is_stored_as_tagged_json() {
        let source = InputSource::ChatFile {
            file_id: "AgAD".to_string(),
            file_name: Some("clip.mp4".to_string()),
            file_size: Some(1024),
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"kind\":\"chat_file\""));
        assert_eq!(serde_json::from_str::<InputSource>(&json).unwrap(), source);
    }
}
