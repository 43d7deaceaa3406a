// Signed session and state tokens, bearer extraction
pub mod auth;

// Broker connect adapters (Kite)
pub mod broker;

// Encrypted broker credential storage
pub mod credentials;

// OAuth state and the authorization flow
pub mod oauth;

// HTTP APIs
pub mod api;

// Configuration loading
pub mod config;
