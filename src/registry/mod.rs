//! Registry module for Docker Registry HTTP API v2 / OCI Distribution pulls
//!
//! Every request goes through a [`RegistryClient`], which admits at most a fixed number of
//! in-flight requests via the [`TransportGate`]. On top of it sit the auth negotiator,
//! the manifest resolver and the blob fetcher.

pub mod auth;
pub mod blob;
pub mod client;
pub mod gate;
pub mod resolver;
pub mod token_manager;
pub mod transport;

pub use auth::{AuthChallenge, AuthNegotiator, BearerToken, Credential};
pub use blob::{BlobFetcher, FetchedBlob};
pub use client::{GatedResponse, RegistryClient, RegistryClientBuilder};
pub use gate::{GatePermit, TransportGate};
pub use resolver::{ManifestResolver, ResolvedManifest};
pub use token_manager::TokenManager;
pub use transport::{
    BodyStream, HttpTransport, RegistryRequest, RegistryResponse, RegistryTransport,
};
