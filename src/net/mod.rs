pub mod mqtt;
pub mod resolve;
pub mod wifi;

pub use mqtt::{BrokerSession, Delivery, PubSubClient, SessionNotifier, TelemetryPublisher};
pub use wifi::{ConnectivityIntent, ConnectivityManager, LinkState, WirelessLink};
