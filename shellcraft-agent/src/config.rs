//! Agent configuration

use shellcraft_core::{ContextConfig, Error, Result, ShellConfig};
use std::time::Duration;

/// Limits that bound one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Model calls allowed before giving up
    pub max_iterations: usize,
    /// Time limit for each command
    pub command_timeout: Duration,
    /// Wall-clock limit for the whole session
    pub session_timeout: Option<Duration>,
}

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model name; the provider default when `None`
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    /// Stream replies (lets observers print them as they arrive)
    pub stream: bool,
    /// Maximum number of iterations (model calls) before stopping
    pub max_iterations: usize,
    /// Time limit for each command
    pub command_timeout: Duration,
    /// Wall-clock limit for the whole session
    pub session_timeout: Option<Duration>,
    /// Consecutive malformed replies tolerated
    pub max_malformed_replies: usize,
    /// Consecutive timed-out commands tolerated
    pub max_consecutive_timeouts: usize,
    /// Extra attempts for a transient model error
    pub model_retries: u32,
    /// Delay between model attempts
    pub model_retry_delay: Duration,
    /// Rewrite Windows drive paths in the task into Git Bash form
    pub posix_paths: bool,
    pub context: ContextConfig,
    pub shell: ShellConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            stream: true,
            max_iterations: 20,
            command_timeout: Duration::from_secs(30),
            session_timeout: None,
            max_malformed_replies: 3,
            max_consecutive_timeouts: 3,
            model_retries: 2,
            model_retry_delay: Duration::from_secs(1),
            posix_paths: cfg!(windows),
            context: ContextConfig::default(),
            shell: ShellConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn budget(&self) -> Budget {
        Budget {
            max_iterations: self.max_iterations,
            command_timeout: self.command_timeout,
            session_timeout: self.session_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.budget().validate()?;

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::config_invalid(format!("temperature {} outside 0.0..=2.0", t))
                    .with_operation("AgentConfig::validate"));
            }
        }
        if self.context.max_output_chars == 0 {
            return Err(Error::config_invalid("max_output_chars must be greater than zero")
                .with_operation("AgentConfig::validate"));
        }
        Ok(())
    }
}

impl Budget {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::config_invalid("max_iterations must be at least 1")
                .with_operation("Budget::validate"));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::config_invalid("command timeout must be greater than zero")
                .with_operation("Budget::validate"));
        }
        if self.session_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config_invalid("session timeout must be greater than zero")
                .with_operation("Budget::validate"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellcraft_core::ErrorKind;

    #[test]
    fn test_default_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = AgentConfig {
            max_iterations: 0,
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let budget = Budget {
            max_iterations: 5,
            command_timeout: Duration::ZERO,
            session_timeout: None,
        };
        assert!(budget.validate().is_err());
    }
}
