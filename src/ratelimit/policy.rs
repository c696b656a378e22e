//! Rate limit policies and their configuration.
//!
//! Policies are loaded once at startup from YAML and never change while the
//! process serves traffic. A policy file looks like:
//!
//! ```yaml
//! policies:
//!   login:
//!     requests_per_unit: 5
//!     unit: minute
//!     units: 15
//!     counting_mode: count_failures_only
//!     rejection_message: Too many failed login attempts, try again later.
//!   chat:
//!     requests_per_unit: 30
//!     unit: minute
//!     key: user_id
//!     on_store_failure: deny
//! routes:
//!   /auth/login: [login]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::key::KeyGenerator;
use super::window::{TimeUnit, WindowStrategy, MAX_WINDOW};
use crate::error::{GatekeeperError, Result};

const DEFAULT_REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// Which request outcomes consume quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    /// Every request counts, checked before the request runs.
    #[default]
    CountAll,
    /// Only failed requests count, recorded after the outcome is known.
    CountFailuresOnly,
    /// Only successful requests count, recorded after the outcome is known.
    CountSuccessesOnly,
}

/// Result of the operation a policy guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl CountingMode {
    /// Whether a request with the given outcome consumes quota.
    ///
    /// `None` means the outcome is not known yet (pre-flight). Only
    /// [`CountingMode::CountAll`] counts pre-flight; the outcome-dependent
    /// modes count post-hoc and so give no pre-flight admission control.
    pub fn counts(&self, outcome: Option<Outcome>) -> bool {
        matches!(
            (self, outcome),
            (CountingMode::CountAll, None)
                | (CountingMode::CountFailuresOnly, Some(Outcome::Failure))
                | (CountingMode::CountSuccessesOnly, Some(Outcome::Success))
        )
    }

    /// Whether the mode is decided after the guarded operation finishes.
    pub fn is_post_hoc(&self) -> bool {
        !matches!(self, CountingMode::CountAll)
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Fail open: let the request through.
    #[default]
    Allow,
    /// Fail closed: reject the request.
    Deny,
}

impl FailureMode {
    pub fn allows(&self) -> bool {
        matches!(self, FailureMode::Allow)
    }
}

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    window: Duration,
    max_count: u64,
    counting_mode: CountingMode,
    key_generator: KeyGenerator,
    strategy: WindowStrategy,
    rejection_message: String,
    on_store_failure: FailureMode,
}

impl Policy {
    /// Start building a policy that allows `max_count` requests per `window`.
    pub fn builder(name: impl Into<String>, max_count: u64, window: Duration) -> PolicyBuilder {
        PolicyBuilder {
            name: name.into(),
            window,
            max_count,
            counting_mode: CountingMode::default(),
            key_generator: KeyGenerator::default(),
            strategy: WindowStrategy::default(),
            rejection_message: None,
            on_store_failure: FailureMode::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    pub fn counting_mode(&self) -> CountingMode {
        self.counting_mode
    }

    pub fn key_generator(&self) -> KeyGenerator {
        self.key_generator
    }

    pub fn strategy(&self) -> WindowStrategy {
        self.strategy
    }

    pub fn rejection_message(&self) -> &str {
        &self.rejection_message
    }

    pub fn on_store_failure(&self) -> FailureMode {
        self.on_store_failure
    }
}

/// Builder for [`Policy`]. Validation happens in [`PolicyBuilder::build`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    name: String,
    window: Duration,
    max_count: u64,
    counting_mode: CountingMode,
    key_generator: KeyGenerator,
    strategy: WindowStrategy,
    rejection_message: Option<String>,
    on_store_failure: FailureMode,
}

impl PolicyBuilder {
    pub fn counting_mode(mut self, mode: CountingMode) -> Self {
        self.counting_mode = mode;
        self
    }

    pub fn key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = generator;
        self
    }

    pub fn strategy(mut self, strategy: WindowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn rejection_message(mut self, message: impl Into<String>) -> Self {
        self.rejection_message = Some(message.into());
        self
    }

    pub fn on_store_failure(mut self, mode: FailureMode) -> Self {
        self.on_store_failure = mode;
        self
    }

    /// Validate and freeze the policy.
    pub fn build(self) -> Result<Policy> {
        let invalid = |reason: &str| GatekeeperError::InvalidPolicy {
            policy: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid("name may only contain [A-Za-z0-9_.-]"));
        }
        if self.max_count == 0 {
            return Err(invalid("max count must be positive"));
        }
        if self.window.as_millis() == 0 {
            return Err(invalid("window must be at least one millisecond"));
        }
        if self.window > MAX_WINDOW {
            return Err(invalid("window must not exceed 366 days"));
        }

        Ok(Policy {
            rejection_message: self
                .rejection_message
                .unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string()),
            name: self.name,
            window: self.window,
            max_count: self.max_count,
            counting_mode: self.counting_mode,
            key_generator: self.key_generator,
            strategy: self.strategy,
            on_store_failure: self.on_store_failure,
        })
    }
}

/// A policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Number of requests allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in `unit`s
    #[serde(default = "default_units")]
    pub units: u32,
    #[serde(default)]
    pub counting_mode: CountingMode,
    #[serde(default)]
    pub key: KeyGenerator,
    #[serde(default)]
    pub strategy: WindowStrategy,
    #[serde(default)]
    pub rejection_message: Option<String>,
    #[serde(default)]
    pub on_store_failure: FailureMode,
}

fn default_units() -> u32 {
    1
}

impl PolicyConfig {
    /// Validate this entry into a [`Policy`] named `name`.
    pub fn into_policy(self, name: &str) -> Result<Policy> {
        if self.units == 0 {
            return Err(GatekeeperError::InvalidPolicy {
                policy: name.to_string(),
                reason: "units must be positive".to_string(),
            });
        }

        let window = self
            .unit
            .duration()
            .checked_mul(self.units)
            .ok_or_else(|| GatekeeperError::InvalidPolicy {
                policy: name.to_string(),
                reason: "window is too long".to_string(),
            })?;

        let mut builder = Policy::builder(name, self.requests_per_unit, window)
            .counting_mode(self.counting_mode)
            .key_generator(self.key)
            .strategy(self.strategy)
            .on_store_failure(self.on_store_failure);
        if let Some(message) = self.rejection_message {
            builder = builder.rejection_message(message);
        }
        builder.build()
    }
}

/// Raw policy file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
    /// Route name to the policies applied to it, in evaluation order.
    #[serde(default)]
    pub routes: HashMap<String, Vec<String>>,
}

/// Every policy known to the process, plus route assignments.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, Arc<Policy>>,
    routes: HashMap<String, Vec<Arc<Policy>>>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a YAML policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)?;
        Self::from_config(file)
    }

    /// Validate raw configuration into a policy set.
    ///
    /// Any invalid policy or any route naming an undefined policy fails the
    /// whole set; a half-loaded configuration must never serve traffic.
    pub fn from_config(file: PolicyFile) -> Result<Self> {
        let mut set = PolicySet::new();
        for (name, config) in file.policies {
            let policy = config.into_policy(&name)?;
            set.policies.insert(name, Arc::new(policy));
        }

        for (route, names) in file.routes {
            let resolved = names
                .iter()
                .map(|name| {
                    set.policies.get(name).cloned().ok_or_else(|| {
                        GatekeeperError::Config(format!(
                            "route '{}' references undefined policy '{}'",
                            route, name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            set.routes.insert(route, resolved);
        }

        Ok(set)
    }

    /// Add a policy. A policy with the same name is replaced.
    pub fn insert(&mut self, policy: Policy) {
        self.policies.insert(policy.name().to_string(), Arc::new(policy));
    }

    /// Assign policies to a route, in evaluation order.
    pub fn assign_route(&mut self, route: impl Into<String>, names: &[&str]) -> Result<()> {
        let route = route.into();
        let resolved = names
            .iter()
            .map(|name| self.get(name).ok_or_else(|| GatekeeperError::UnknownPolicy(name.to_string())))
            .collect::<Result<Vec<_>>>()?;
        self.routes.insert(route, resolved);
        Ok(())
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// Policies applied to a route. Unknown routes have none.
    pub fn for_route(&self, route: &str) -> &[Arc<Policy>] {
        self.routes.get(route).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate over all policies.
    pub fn policies(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.values()
    }

    /// Iterate over route assignments.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &[Arc<Policy>])> {
        self.routes.iter().map(|(route, policies)| (route.as_str(), policies.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
