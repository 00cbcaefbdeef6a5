//! Built-in OAuth providers

pub mod custom;
pub mod github;
pub mod google;

pub use custom::CustomProvider;
pub use github::GitHubProvider;
pub use google::GoogleProvider;
