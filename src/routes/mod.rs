pub mod admin;
pub mod generation;
pub mod webhooks;
