//! # Crawl Crew
//!
//! A supervisor that delegates web data collection to a crew of LLM workers.
//!
//! This library provides:
//! - A fixed navigator → coder → analyst pipeline driven by a supervisor
//! - Worker agents with their own tools and conversation threads
//! - A leasable shared browser session for multi-step browsing
//! - An HTTP API with SSE streaming, and a client that reassembles streams
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │       SupervisorController       │
//!        │   (stage order, final report)    │
//!        └────────────────┬─────────────────┘
//!                         │ DelegationRequest
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!     ┌─────────┐    ┌─────────┐    ┌─────────┐
//!     │Navigator│    │  Coder  │    │ Analyst │
//!     └────┬────┘    └────┬────┘    └────┬────┘
//!          │              │              │
//!     browse_web     python, files     python
//!          │              └──────┬───────┘
//!          ▼                     ▼
//!    SharedBrowser        artifact directory
//! ```
//!
//! ## Task Flow
//! 1. Receive a request via the API
//! 2. Navigator explores the site and returns a JSON Blueprint
//! 3. Coder implements the Blueprint and saves the data
//! 4. Analyst charts the data
//! 5. Supervisor streams a report listing every artifact
//!
//! ## Modules
//! - `agents`: workers, delegation adapters and the supervisor
//! - `llm`: model clients and the model resolver
//! - `browser`: page fetching backends and the shared session lease
//! - `client`: API client and stream aggregation

pub mod agents;
pub mod api;
pub mod artifacts;
pub mod blueprint;
pub mod browser;
pub mod client;
pub mod config;
pub mod crew;
pub mod llm;
pub mod stream;
pub mod threads;
pub mod tools;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use crew::Crew;
