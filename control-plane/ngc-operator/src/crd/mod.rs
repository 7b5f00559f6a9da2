pub mod common;
pub mod gateway_bundle;
pub mod inference_stack;
