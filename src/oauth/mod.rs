//! OAuth device-flow tokens for authenticated HTTP backends.
//!
//! A `TokenStore` is constructed once and handed to every transport that
//! needs it. It owns the token directory and the HTTP client used to talk to
//! providers.

pub mod device_flow;
pub mod errors;
pub mod store;
pub mod types;

pub use device_flow::PollOutcome;
pub use errors::OAuthError;
pub use store::{PollSettings, TokenStore};
pub use types::{DeviceCodeResponse, OAuthConfig, OAuthToken, ProviderConfig, TokenStatus};
