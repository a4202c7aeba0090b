pub mod fetch;
pub mod ntas;
pub mod oracle;
pub mod orchestrator;
pub mod parser;
pub mod poller;
pub mod registry;
pub mod stats;
pub mod store;
