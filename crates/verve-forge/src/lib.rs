pub mod client;
pub mod command;
pub mod error;

pub use client::{CheckStatus, ForgeClient, GhCliForgeClient, Mergeability, PrCheckStatus};
pub use error::ForgeError;
