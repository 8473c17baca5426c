pub mod provider;
pub mod types;

pub use provider::{HttpJsonProvider, Provider, ProviderError};
pub use types::{FetchKey, ProviderData, ProviderKind};
