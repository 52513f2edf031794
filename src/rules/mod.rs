pub mod cache;
pub mod matcher;
pub mod pac;
pub mod pacgen;
pub mod regex;

pub use cache::HostCache;
pub use matcher::{match_request, MatchOutcome};
