//! Model providers. Only the scripted mock ships here; HTTP providers plug in
//! through [`kestrel_core::provider::ModelProvider`].

pub mod mock;

pub use mock::{MockProvider, MockResponse};
