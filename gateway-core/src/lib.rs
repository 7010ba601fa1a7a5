//! # gateway-core
//!
//! Realtime WebSocket data-service gateway: a single-port WS protocol for
//! document storage, a pub/sub rule engine, declarative procedures, and
//! built-in or pluggable-external identity, with a tamper-evident audit
//! trail over every authenticated operation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::load()?;
//!     let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//!
//!     let server = GatewayServerBuilder {
//!         config,
//!         store,
//!         rules: None,
//!         auth_mode: Arc::new(AuthMode::None),
//!     }
//!     .build();
//!
//!     server.start().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod authz;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod ids;
pub mod procedures;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod rules;
pub mod server;
pub mod store;
pub mod subscriptions;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::audit::{AuditChain, AuditEvent, AuditEventKind, AuditLogger};
    pub use crate::authz;
    pub use crate::config::GatewayConfig;
    pub use crate::dispatcher::{dispatch, DispatcherContext};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::heartbeat;
    pub use crate::identity::{
        AuthEpoch, AuthMode, Blacklist, BuiltinIdentity, PasswordHasher, PermissionsCheck,
        Session, Validator, SUPERADMIN_USER_ID,
    };
    pub use crate::ids::{AuditEventId, ConnectionId, RequestId, SessionId, SubscriptionId};
    pub use crate::procedures::{Procedure, ProcedureRegistry};
    pub use crate::protocol::{ClientFrame, ClientRequest, PushChannel, ServerFrame, SystemEvent};
    pub use crate::ratelimit::{LoginRateLimiter, RateLimiter};
    pub use crate::registry::{ConnectionRecord, ConnectionRegistry, ConnectionSignal};
    pub use crate::rules::{MemoryRuleEngine, RuleEngine};
    pub use crate::server::{GatewayServer, GatewayServerBuilder};
    pub use crate::store::{BucketConfig, MemoryStore, Store, TxOp};
    pub use crate::subscriptions::SubscriptionRegistry;
}
