pub mod enqueue;
pub mod jobs;
