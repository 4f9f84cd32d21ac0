//! Video site specific processors
//!
//! Video files are cached under `<type><id>`, for example `sm9.flv`. The
//! type is not part of the video server URL, so it is recorded from watch
//! pages and API calls as the browser visits them.

pub mod caching_listener;
pub mod caching_processor;
pub mod metadata;
pub mod recording;
pub mod title;

pub use caching_listener::{select_wrapup, CachingListener, ContentRange, Wrapup};
pub use caching_processor::{CachingProcessor, MovieRequest};
pub use metadata::{IdInfo, MetadataCache};
pub use recording::{RecordingUrlProcessor, RecordingWatchProcessor};
pub use title::{ThumbInfoTitleResolver, TitleResolver};
