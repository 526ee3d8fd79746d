pub mod hub;
pub mod types;

pub use hub::Hub;
pub use types::{FeedbackPollResult, TaskEvent};
