pub mod error;
pub mod input;
pub mod process;
pub mod progress;
pub mod task;
pub mod tool;

pub use error::{CoreError, CoreErrorKind, TaskError, truncate_message};
pub use input::{InputSource, QueueItem, UploadSettings};
pub use process::ProcessEntry;
pub use progress::{ProgressRecord, StatusEvent};
pub use task::{
    NewTask, TaskId, TaskOutcome, TaskRecord, TaskStatus, TaskUpdate, UploadReceipt, UserId,
};
pub use tool::{
    EncodeSettings, ExtractMode, FlipDirection, GifQuality, MergeMode, SamplePoint,
    ThumbnailMode, ToolKind, ToolSettings, WatermarkKind, WatermarkPosition,
};
