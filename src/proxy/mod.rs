//! Outbound calls to the RAG answer backend.

pub mod rag;

pub use rag::{RagClient, RagConfig, RatingRequest, SearchRequest, SearchResponse};
