pub mod alerting;
pub mod coinbase;
pub mod http;
pub mod lock;
pub mod mock;
pub mod observability;
pub mod paper;
pub mod state;
