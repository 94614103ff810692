pub mod health;
pub mod locks;
pub mod metrics;
pub mod outbox;
pub mod sagas;
