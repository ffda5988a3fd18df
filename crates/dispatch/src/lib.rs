pub mod dlq;
pub mod history;
pub mod producer;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transition;
