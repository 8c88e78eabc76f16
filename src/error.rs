pub use llama_dispatch_layers::error::BoxedError;
