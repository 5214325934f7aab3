//! HTTP adapters: outbound call executor and callback signature helpers.

pub mod outbound;
pub mod secret;
