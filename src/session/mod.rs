//! 会话 - 平台连接、凭据存储与 Session Owner

pub mod http;
pub mod owner;
pub mod platform;
pub mod store;

pub use http::HttpPlatform;
pub use owner::{SessionCommand, SessionHandle, SessionOwner};
pub use platform::{
    AuthProgress, AuthStep, ConnectOutcome, Dialog, Participant, PlatformClient, UserInfo,
};
pub use store::{CredentialStore, SessionState};
