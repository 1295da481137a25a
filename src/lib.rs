pub mod calendar_bitmap;
pub mod export;
pub mod feed;
pub mod gtfs_import;
pub mod merge;
pub mod messages;
pub mod pipeline;
pub mod stop_matcher;
