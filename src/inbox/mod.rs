//! Inbox items, their realtime feed, and the HTTP surface.

pub mod feed;
pub mod model;
pub mod ws;

pub use feed::{FeedMessage, InboxFeed, InboxList};
pub use model::{Classification, ClassificationResult, FileType, InboxItem, InboxSource, InboxStatus};
pub use ws::inbox_routes;
