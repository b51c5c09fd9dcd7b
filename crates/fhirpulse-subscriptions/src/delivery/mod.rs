//! Delivery channels.

pub mod callback;
pub mod webhook;

pub use callback::{
    CallbackError, CallbackHandler, CallbackInput, CallbackRuntime, InProcessCallbackRuntime,
};
pub use webhook::WebhookChannel;
