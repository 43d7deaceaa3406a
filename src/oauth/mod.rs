//! Broker authorization over an OAuth-style redirect.
//!
//! 1. User clicks "Connect" in the UI
//! 2. GET /api/brokers/:broker/connect → state cookie set, redirect to broker
//! 3. User logs in on the broker's site
//! 4. Broker redirects to /api/brokers/:broker/callback with a request token
//! 5. State cookie verified and consumed, request token exchanged for a session
//! 6. Access token stored encrypted; user redirected back to the app
//!
//! State is single use. A replayed callback fails even while the cookie's
//! signature is still valid.

mod cookie;
mod flow;
pub mod state_store;

pub use cookie::{StateCookie, DEFAULT_COOKIE_NAME};
pub use flow::{
    AuthorizationFlow, BrokerLink, CallbackQuery, Completion, FlowError, FlowSettings, Initiation,
};
pub use state_store::{
    run_state_cleanup, MemoryStateStore, SqliteStateStore, StateStore, StateStoreError,
};
