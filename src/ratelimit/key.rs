//! Counter key generation.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// Who is making the request, as supplied by the identity layer.
///
/// All fields are opaque to the engine; they only ever become key
/// components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    /// Authenticated user id, if the caller is logged in.
    pub user_id: Option<String>,
    /// Network origin address.
    pub remote_addr: Option<IpAddr>,
    /// Target resource, for per-resource quotas.
    pub resource_id: Option<String>,
}

impl CallerContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for an anonymous caller identified only by address.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self::new().with_remote_addr(addr)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }
}

/// How a policy derives the caller part of its counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGenerator {
    /// Authenticated user id, falling back to the remote address.
    #[default]
    UserOrIp,
    /// Authenticated user id only.
    UserId,
    /// Remote address only, even for authenticated callers.
    Ip,
    /// Target resource combined with user-or-ip, for per-resource quotas.
    ResourceAndUser,
}

impl KeyGenerator {
    /// Derive the identity string for a caller.
    ///
    /// Components are tagged and escaped so a user id can never impersonate
    /// an address or resource component.
    pub fn identity(&self, policy: &str, caller: &CallerContext) -> Result<String> {
        match self {
            KeyGenerator::UserOrIp => user_or_ip(policy, caller),
            KeyGenerator::UserId => caller
                .user_id
                .as_deref()
                .map(|id| format!("user:{}", escape(id)))
                .ok_or_else(|| missing(policy, "user id")),
            KeyGenerator::Ip => caller
                .remote_addr
                .map(|addr| format!("ip:{}", escape(&addr.to_string())))
                .ok_or_else(|| missing(policy, "remote address")),
            KeyGenerator::ResourceAndUser => {
                let resource = caller
                    .resource_id
                    .as_deref()
                    .ok_or_else(|| missing(policy, "resource id"))?;
                Ok(format!("res:{}:{}", escape(resource), user_or_ip(policy, caller)?))
            }
        }
    }
}

fn user_or_ip(policy: &str, caller: &CallerContext) -> Result<String> {
    if let Some(id) = caller.user_id.as_deref() {
        return Ok(format!("user:{}", escape(id)));
    }
    caller
        .remote_addr
        .map(|addr| format!("ip:{}", escape(&addr.to_string())))
        .ok_or_else(|| missing(policy, "user id or remote address"))
}

fn missing(policy: &str, component: &'static str) -> GatekeeperError {
    GatekeeperError::MissingKeyComponent {
        policy: policy.to_string(),
        component,
    }
}

/// Escape the key delimiter so opaque ids cannot forge extra components.
fn escape(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

/// A fully qualified counter key in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Namespace prefix shared by every key this deployment writes
    pub prefix: String,
    /// Policy name
    pub policy: String,
    /// Tagged caller identity
    pub identity: String,
    /// Fixed-window bucket id, absent for sliding logs
    pub window: Option<i64>,
}

impl CounterKey {
    /// Build the key for a caller under a policy.
    pub fn new(
        prefix: &str,
        policy: &str,
        generator: KeyGenerator,
        caller: &CallerContext,
        window: Option<i64>,
    ) -> Result<Self> {
        Ok(Self {
            prefix: prefix.to_string(),
            policy: policy.to_string(),
            identity: generator.identity(policy, caller)?,
            window,
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.policy, self.identity)?;
        if let Some(window) = self.window {
            write!(f, ":{}", window)?;
        }
        Ok(())
    }
}
