// HTTP APIs

pub mod brokers;

pub use brokers::{create_broker_router, BrokerAppState, BrokerStatusResponse, RedirectTargets};
