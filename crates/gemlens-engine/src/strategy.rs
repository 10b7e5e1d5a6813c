use tracing::{info, warn};

use crate::error::error_chain_text;

/// One way of producing a value; tried in order by [`run_chain`].
pub struct Strategy<'a, T> {
    pub name: String,
    run: Box<dyn FnOnce() -> anyhow::Result<T> + 'a>,
}

impl<'a, T> Strategy<'a, T> {
    pub fn new(name: impl Into<String>, run: impl FnOnce() -> anyhow::Result<T> + 'a) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub strategy: String,
    pub message: String,
}

impl AttemptFailure {
    pub fn describe(&self) -> String {
        format!("{}: {}", self.strategy, self.message)
    }
}

#[derive(Debug)]
pub struct ChainOutcome<T> {
    pub value: T,
    pub winner: String,
    pub failures: Vec<AttemptFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainExhausted {
    pub failures: Vec<AttemptFailure>,
}

impl ChainExhausted {
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(AttemptFailure::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Runs strategies in order and stops at the first success. Earlier
/// failures travel with the result.
pub fn run_chain<T>(strategies: Vec<Strategy<'_, T>>) -> Result<ChainOutcome<T>, ChainExhausted> {
    let mut failures = Vec::new();
    for strategy in strategies {
        let Strategy { name, run } = strategy;
        match run() {
            Ok(value) => {
                if !failures.is_empty() {
                    info!(strategy = %name, prior_failures = failures.len(), "fallback strategy succeeded");
                }
                return Ok(ChainOutcome {
                    value,
                    winner: name,
                    failures,
                });
            }
            Err(err) => {
                let message = error_chain_text(&err, 400);
                warn!(strategy = %name, error = %message, "strategy failed");
                failures.push(AttemptFailure {
                    strategy: name,
                    message,
                });
            }
        }
    }
    Err(ChainExhausted { failures })
}
