//! Auth synchronization engine.
//!
//! Discovers a token pair wherever the user obtained it, moves it into
//! backend-domain cookies, verifies it against the backend, and keeps
//! proxied requests authenticated:
//! - [`BackendAuthClient`]: `/auth/login`, `/auth/logout`, `/auth/status`,
//!   `/auth/refresh` with browser-style cookie handling
//! - [`CookieTransfer`] and [`TransferLock`]: the single cookie write routine
//! - [`ExternalTokenSource`]: tokens from the auth website
//! - [`TokenRefreshProxy`]: 401 → refresh once → retry once
//! - [`coordinator`]: the actor that owns the session state
//! - [`BackgroundRouter`]: background-process message dispatch

mod auth_fsm;
mod background;
mod backend_client;
mod context;
pub mod coordinator;
mod credentials;
mod domain;
mod error;
mod external_source;
mod refresh_proxy;
mod transfer;
mod types;

pub use auth_fsm::{
    CoordinatorInput, CoordinatorMachine, CoordinatorMachineState, CoordinatorPhase,
};
pub use background::BackgroundRouter;
pub use backend_client::BackendAuthClient;
pub use context::AuthContext;
pub use coordinator::{
    AuthSignal, CoordinatorEvent, CoordinatorHandle, CoordinatorOptions, CoordinatorSnapshot,
};
pub use credentials::CookieCredentials;
pub use domain::{CookieNames, DomainConfig};
pub use error::{AuthError, AuthResult, ErrorKind};
pub use external_source::{AuthSiteTabs, ExternalTokenSource, NoAuthSiteTabs, TokenOrigin};
pub use refresh_proxy::TokenRefreshProxy;
pub use transfer::{CookieTransfer, TransferGuard, TransferLock, TransferOutcome};
pub use types::{BackendStatus, SessionState, TokenPair, User};
