pub mod catalog;
pub mod completion;

pub use catalog::{ProviderCatalog, ProviderDescriptor, ProviderLimits};
pub use completion::{
    ChatMessage, Completion, CompletionBackend, CompletionError, HttpCompletionBackend,
};
