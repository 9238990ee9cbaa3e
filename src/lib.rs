//! DBG-CORE: session-serialized debug services.
//!
//! Every debug session owns one [`SessionDispatcher`], a single logical
//! thread of control on which all operations against shared debugger state
//! run. Operations return a [`CompletionToken`], a typed future that can be
//! awaited, cancelled, or chained with continuations on the same dispatcher.
//!
//! The [`memory`] module provides the memory service of a session: reads,
//! writes and pattern fills of target memory behind a cache that fetches
//! only what is missing and stays coherent across writes and target-side
//! change notifications.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dbg_core::memory::{ContextId, SimulatedTarget};
//! use dbg_core::{Session, SessionConfig};
//!
//! # async fn demo() -> Result<(), dbg_core::DebugError> {
//! let target = Arc::new(SimulatedTarget::new());
//! let ctx = ContextId::new();
//! target.map_counting(ctx, 0, 256);
//!
//! let session = Session::open(target, SessionConfig::default());
//! session.memory().attach_context(ctx).await?;
//! let bytes = session.memory().get(ctx, 0x10, 0, 1, 16).await?;
//! assert_eq!(bytes.len(), 16);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod memory;
pub mod session;
pub mod shutdown;
pub mod telemetry;

pub use dispatch::{CompletionToken, DispatcherConfig, SessionDispatcher};
pub use error::DebugError;
pub use events::{EventBus, SubscriptionId};
pub use session::{Session, SessionConfig, SessionId, SessionRegistry};
pub use shutdown::{ShutdownResult, ShutdownState};
