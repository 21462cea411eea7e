pub mod application_state;
pub mod cli;
pub mod config;
pub mod decoder;
pub mod flow;
pub mod forwarder;
pub mod importers;
pub mod metrics;
pub mod queue;
pub mod settings;
pub mod storage;
pub mod templates;
pub mod validator;
pub mod workers;
