//! Knowledge providers: external document search services queried by
//! knowledge-kind tools.

pub mod conversational;
pub mod errors;
pub mod provider;
pub mod registry;
pub mod search;
pub mod types;

pub use errors::KnowledgeError;
pub use provider::KnowledgeProvider;
pub use registry::{build_provider, KnowledgeRegistry};
pub use types::{KnowledgeDocument, KnowledgeQuery, KnowledgeResponse, ProviderRecord, QueryStatus};
