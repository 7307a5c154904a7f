//! HTTP API.
//!
//! Every agent is reachable under `/api/agents/:agent/...` where `:agent` is
//! `supervisor`, `navigator`, `coder` or `analyst`. Streaming endpoints emit
//! one [`StreamEvent`](crate::stream::StreamEvent) per SSE `data:` line and
//! always finish with `done`.

mod routes;
mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
