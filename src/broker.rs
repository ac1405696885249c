//! Broker-side components: the per-connection engine and its collaborators.

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod post_office;
pub mod registry;
pub mod session;

pub use auth::{AllowAllAuthenticator, Authenticator, PasswordFileAuthenticator};
pub use channel::Channel;
pub use config::BrokerConfig;
pub use connection::{Connection, ConnectionEvent};
pub use post_office::{MessageRouter, PostOffice};
pub use registry::{CreationMode, SessionCreationResult, SessionRegistry};
pub use session::{DeliveryRequest, Session, SessionState};
