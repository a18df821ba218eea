//! This crate provides common functionality that the other crates in the workspace can benefit
//! from.

pub mod futures;
