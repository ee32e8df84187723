//! Tag existence check with bounded retries.

use crate::backend::CondDbBackend;
use crate::connection::ConnectionManager;
use conddb_core::{is_head_tag, CondDbConfig, CondDbResult, TagError};
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

/// Outcome of [`TagResolver::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagValidation {
    /// The tag exists; `trials` checks were made (0 for HEAD).
    Found { trials: u32 },
    /// Not found after `trials` checks.
    Missing { trials: u32 },
}

impl TagValidation {
    pub fn is_found(&self) -> bool {
        matches!(self, TagValidation::Found { .. })
    }

    pub fn trials(&self) -> u32 {
        match self {
            TagValidation::Found { trials } | TagValidation::Missing { trials } => *trials,
        }
    }
}

/// Checks that a tag exists, retrying to ride out replica lag.
#[derive(Debug, Clone)]
pub struct TagResolver {
    max_trials: u32,
    retry_delay: Duration,
}

impl TagResolver {
    /// `max_trials <= 1` means a single check with no retry.
    pub fn new(max_trials: u32, retry_delay: Duration) -> Self {
        Self {
            max_trials: max_trials.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &CondDbConfig) -> Self {
        Self::new(config.check_tag_trials, config.check_tag_delay())
    }

    pub fn max_trials(&self) -> u32 {
        self.max_trials
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Look for `tag` up to `max_trials` times, sleeping `retry_delay`
    /// between checks. A check that fails to reach the backend counts as a
    /// failed trial.
    pub fn validate<B: CondDbBackend>(
        &self,
        connection: &ConnectionManager<B>,
        tag: &str,
    ) -> TagValidation {
        if is_head_tag(tag) {
            return TagValidation::Found { trials: 0 };
        }

        for trial in 1..=self.max_trials {
            match connection.with_connection(|backend| backend.tag_exists(tag)) {
                Ok(true) => {
                    tracing::info!(tag, trial, "tag found");
                    return TagValidation::Found { trials: trial };
                }
                Ok(false) => {
                    tracing::warn!(tag, trial, max_trials = self.max_trials, "tag not found");
                }
                Err(e) => {
                    tracing::warn!(tag, trial, max_trials = self.max_trials, error = %e, "tag check failed");
                }
            }
            if trial < self.max_trials {
                thread::sleep(self.retry_delay);
            }
        }

        TagValidation::Missing {
            trials: self.max_trials,
        }
    }

    /// Like [`validate`](Self::validate), but a missing tag is an error.
    pub fn require<B: CondDbBackend>(
        &self,
        connection: &ConnectionManager<B>,
        tag: &str,
    ) -> CondDbResult<u32> {
        match self.validate(connection, tag) {
            TagValidation::Found { trials } => Ok(trials),
            TagValidation::Missing { trials } => Err(TagError::NotFound {
                tag: tag.to_string(),
                trials,
            }
            .into()),
        }
    }
}

/// Generates tag names that collide with nothing already taken.
///
/// Names have the form `_auto_<base>-<n>`. The taken set starts with every
/// tag in the database and grows with each generated or reserved name.
#[derive(Debug, Clone)]
pub struct AutoTagNamer {
    base: String,
    taken: BTreeSet<String>,
    counter: u64,
}

impl AutoTagNamer {
    pub fn new(base: impl Into<String>, existing: BTreeSet<String>) -> Self {
        Self {
            base: base.into(),
            taken: existing,
            counter: 0,
        }
    }

    pub fn is_taken(&self, tag: &str) -> bool {
        self.taken.contains(tag)
    }

    /// Mark `tag` as used. Returns false if it already was.
    pub fn reserve(&mut self, tag: &str) -> bool {
        self.taken.insert(tag.to_string())
    }

    pub fn next_name(&mut self) -> String {
        loop {
            let candidate = format!("_auto_{}-{}", self.base, self.counter);
            self.counter += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}
