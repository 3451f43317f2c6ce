//! `skilllite-agent`: the local-LLM agent harness.
//!
//! Drives a weak or medium-capability model through multi-step tool-using
//! work toward a goal, with transactional checkpointing over a version
//! control backend and automatic recovery from model misbehavior. See
//! [`harness::orchestrator::Orchestrator`] for the entry point.

pub mod harness;
