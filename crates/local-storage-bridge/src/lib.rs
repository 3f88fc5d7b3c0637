//! Page-context side of the auth sync extension.
//!
//! Runs inside pages served by the auth website. [`LocalStorageBridge`]
//! answers `getTokensFromLocalStorage` from the page's local storage and
//! pushes `authCompleted` when it notices a new access token. [`BridgeTabs`]
//! connects open pages to the background process through the engine's
//! [`auth_engine::AuthSiteTabs`] seam.

mod page;
mod tabs;

pub use page::{LocalStorageBridge, PageStorageKeys};
pub use tabs::{BridgeRequest, BridgeTabs, DEFAULT_REPLY_TIMEOUT};
