//! Integration tests for the chat pipeline.
//!
//! These tests wire the real orchestrator, SQL agent, and conversation
//! store to scripted doubles of the LLM gateway and query executor. The
//! doubles service the same actor channels as production, so everything
//! from classification through correction and checkpointing runs for
//! real.

pub mod pipeline_integration;
pub mod support;
