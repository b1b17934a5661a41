//! Agent pool and registry.

mod manager;
mod registry;
mod session;

pub use manager::{
    AgentManager, CompletionCallback, DEFAULT_MAX_CONCURRENT_AGENTS, ManagerError, StartOptions,
};
pub use registry::{AgentRegistry, RegistryError};
pub use session::{AgentSession, CompletionOutcome, SessionState};
