use storefront_contracts::OrderId;
use thiserror::Error;

use crate::completion::CompletionError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Failures a handler can hit. Everything that reaches the dispatch boundary
/// is journaled and replaced by one generic message to the chat.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("cart is empty")]
    EmptyCart,
    #[error("no order is awaiting payment evidence")]
    NoLinkedOrder,
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    #[error("external service failed: {0}")]
    ExternalService(String),
    #[error("actor is not allowed to do this")]
    Unauthorized,
    #[error("completion did not produce a well-formed plan")]
    MalformedPlan,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::ExternalService(err.to_string())
    }
}

impl From<CompletionError> for EngineError {
    fn from(err: CompletionError) -> Self {
        EngineError::ExternalService(err.to_string())
    }
}
