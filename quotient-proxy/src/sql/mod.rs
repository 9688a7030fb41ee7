//! Minimal SQL front end for the rewrite pipeline.
//!
//! This is deliberately not a general SQL parser: the lexer and parser
//! understand exactly enough of INSERT and UPDATE to locate column lists,
//! VALUES tuples and SET assignments while preserving every other byte of
//! the statement. Anything outside that subset passes through untouched.

pub mod lexer;
pub mod parser;
pub mod rewriter;

pub use rewriter::{rewrite_query, Rewrite};
