//! Backend abstraction used by the `nerve` CLI: the same [`Command`]/
//! [`CommandResponse`] pair is dispatched either in-process or over a
//! running daemon's Unix socket (SPEC_FULL.md §A.4).

mod local;
mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use async_trait::async_trait;
use nerve::command::{Command, CommandResponse};

#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn send(&self, command: Command) -> CommandResponse;
}
