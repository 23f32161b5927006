//! # tether-runtime
//!
//! The async half of Tether: retries, backend failover, the cloud session
//! and the approval gate, wired together by [`Host`].
//!
//! ## Layout
//!
//! - [`retry`]: bounded exponential backoff with a structured error journal
//! - [`backend`]: local/cloud election, health probes and the cloud session
//! - [`approval`]: sign-off queue for risky operations
//! - [`host`]: the facade the UI layer talks to
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::VaultPaths;
//! use tether_runtime::{ChatMessage, Host};
//!
//! let host = Host::builder()
//!     .paths(VaultPaths::new("/home/ada/.config/tether"))
//!     .build()?;
//! host.start().await;
//!
//! let reply = host.send_chat(&[ChatMessage::user("hello")], None).await?;
//! println!("{}", reply.content);
//! ```

pub mod approval;
pub mod backend;
pub mod chat;
pub mod credential;
pub mod events;
pub mod host;
pub mod retry;

pub use approval::{
    ApprovalError, ApprovalEvent, ApprovalGate, ApprovalOutcome, ApprovalRequest, ApprovalTicket,
    Decision,
};
pub use backend::{
    BackendError, BackendOrchestrator, BackendSelection, BackendState, CloudSession,
    Connectivity, HttpRequest, HttpResponse, HttpTransport, LocalLauncher, SessionStatus,
    TransportError,
};
pub use chat::{ChatMessage, ChatReply, ToolCall};
pub use credential::{AccessToken, CredentialSource};
pub use events::{EventBus, EventBusError};
pub use host::{Host, HostBuilder, HostError};
pub use retry::{CallContext, ErrorEvent, ErrorStats, RetryEngine, RetryEvent};
