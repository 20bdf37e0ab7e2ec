pub mod routes;

// The wire types for POST /evaluate live with the engine.
pub use crate::evaluation::EvaluationRequest;
