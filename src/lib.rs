#![deny(clippy::implicit_return)]
#![allow(clippy::needless_return)]

pub mod application;
pub mod configuration;
pub mod domain;
pub mod infrastructure;

pub use crate::application::facade::AssistantCore;
pub use crate::configuration::Config;
pub use crate::configuration::ConfigKey;
pub use crate::domain::models::Message;
pub use crate::domain::models::MessageImage;
pub use crate::domain::models::Role;
pub use crate::domain::models::Session;
pub use crate::domain::models::StreamEvent;
pub use crate::domain::models::ToolActivity;
pub use crate::infrastructure::remote::RemoteClient;
pub use crate::infrastructure::stores::DocumentStore;
pub use crate::infrastructure::stores::JsonFileStore;
pub use crate::infrastructure::stores::MemoryStore;
