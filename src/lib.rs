pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod locality;
pub mod model;
pub mod node;
pub mod operator;
pub mod partition;
pub mod recovery;
pub mod resolver;
pub mod restart;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod worker;
