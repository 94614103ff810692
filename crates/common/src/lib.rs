pub mod types;

pub use types::{MessageId, SagaId};
