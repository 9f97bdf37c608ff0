//! LAN peer discovery and secure session bootstrap.
//!
//! Instances of the same service find each other on the local network via
//! multicast DNS, merge the answer fragments into resolved peer descriptors,
//! maintain a registry of known peers and bring up a mutually authenticated
//! RPC endpoint those peers connect to.

mod aggregator;
mod cert_server;
mod config;
mod connector;
mod credentials;
mod mdns;
mod profile;
mod registry;
mod rpc;
mod server;

pub use aggregator::Aggregator;
pub use aggregator::Answer;
pub use aggregator::ResolvedService;
pub use aggregator::ResolvedSink;
pub use cert_server::CertServer;
pub use config::Config;
pub use config::DEFAULT_PORT;
pub use connector::Connector;
pub use credentials::Credential;
pub use credentials::CredentialError;
pub use credentials::CredentialProvider;
pub use credentials::SelfSignedProvider;
pub use profile::ServiceProfile;
pub use profile::SERVICE_TYPE;
pub use registry::Registry;
pub use registry::Remote;
pub use registry::RemoteStatus;
pub use rpc::RpcError;
pub use rpc::RpcServer;
pub use server::Server;
pub use server::StartError;
