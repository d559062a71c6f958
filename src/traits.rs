//! External capability interfaces: the LLM and embedding contracts.
//!
//! Concrete providers (a specific LLM vendor, a specific embedding model) are
//! out of scope for this crate; only the trait contracts are defined here,
//! plus deterministic in-memory fakes used by the test suite.

pub use embedding::*;
pub use llm::*;

pub mod embedding;
pub mod llm;
