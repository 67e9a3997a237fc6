pub mod admission;
pub mod breaker;
pub mod credits;
pub mod dispatch;
pub mod jobs;
pub mod providers;
pub mod recovery;
pub mod storage;
pub mod webhook;
