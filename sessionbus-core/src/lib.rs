//! # sessionbus: session-scoped message bus
//!
//! An in-process bus that routes commands to exactly one handler and events
//! to every interested handler, with handlers registered per session scope.
//!
//! ## Building Blocks
//!
//! - Messages and handlers ([`event::message`], [`event::handler`])
//! - Scoped handler registry ([`event::handler_registry`])
//! - Dispatcher with a background delivery loop ([`event::message_bus`])
//! - Sessions that clean up after themselves ([`event::session`])
//! - Scheduled events and crash recovery ([`event::scheduled`], [`event::recovery`], [`storage`])
//! - Approval workflows with expiry ([`event::approval`])
//! - Configuration ([`config`]) and errors ([`error`])
//!
//! ## Handler Resolution
//!
//! ```text
//! event (session S) ─► handlers in S ─► handlers in ROOT ─► handlers in GLOBAL
//! command (session S) ─► the one handler bound to (S, type), else NoHandler
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sessionbus_core::{MessageBus, config::BusConfig};
//!
//! # async fn example() -> Result<(), sessionbus_core::BusError> {
//! let bus = Arc::new(MessageBus::new(BusConfig::default()));
//! bus.start().await;
//!
//! let session = bus.create_session(None).await?;
//! // register handlers on the session, execute commands, publish events
//! session.close(None);
//!
//! bus.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod storage;
pub mod testing;

// Re-exports
pub use error::*;
pub use event::*;
