//! # shellcraft core
//!
//! Building blocks for a command-line agent that turns a natural-language
//! task into shell commands, one at a time.
//!
//! ## Core Concepts
//! - **Turn**: one model reply and the command result it produced
//! - **Context Store**: the task plus turn history, rendered into a
//!   size-bounded prompt
//! - **Extractor**: pulls at most one command (or a completion marker) out of
//!   a reply
//! - **Shell Executor**: runs a command in a fresh shell with a timeout
//! - **Provider**: trait-based access to an OpenAI-compatible model service

pub mod context;
pub mod error;
pub mod extract;
pub mod path;
pub mod preamble;
pub mod provider;
pub mod shell;
pub mod turn;

pub use context::{truncate_middle, ContextConfig, ContextStore, Prompt};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use extract::{extract, Action, Extraction, ReplyWarning};
pub use path::convert_windows_paths;
pub use preamble::SYSTEM_PREAMBLE;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    OpenAIProvider, ProviderConfig, ProviderError, Role, StreamChunk, StreamReceiver, Usage,
    UsageTracker,
};
pub use shell::{ShellConfig, ShellExecutor};
pub use turn::{CommandResult, Task, Turn, KILLED_EXIT_CODE};
