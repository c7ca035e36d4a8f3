//! Per-operation tenant context.
//!
//! A [`RequestContext`] is built once per inbound message or HTTP request and
//! passed by reference through every call. It is never stored in ambient or
//! task-local state, so concurrent operations cannot observe each other's
//! headers.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::uuid_utils::new_v7;

/// Attribute / header carrying the tenant (data partition) id.
pub const DATA_PARTITION_ID: &str = "data-partition-id";
/// Attribute / header carrying the account id.
pub const ACCOUNT_ID: &str = "account-id";
/// Attribute / header carrying the acting user's identity.
pub const USER: &str = "user";
/// Attribute / header carrying the correlation id.
pub const CORRELATION_ID: &str = "correlation-id";

/// Immutable tenant and tracing identity for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    partition_id: String,
    account_id: String,
    user: Option<String>,
    correlation_id: String,
}

impl RequestContext {
    /// Context for `partition_id` with a freshly generated correlation id.
    pub fn new(partition_id: impl Into<String>) -> Self {
        let partition_id = partition_id.into();
        Self {
            account_id: partition_id.clone(),
            partition_id,
            user: None,
            correlation_id: new_v7().to_string(),
        }
    }

    /// Build a context from message attributes or request headers.
    ///
    /// `data-partition-id` is required. `account-id` defaults to the partition
    /// and a missing `correlation-id` is generated.
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Result<Self> {
        let non_blank = |key: &str| {
            attributes
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let partition_id = non_blank(DATA_PARTITION_ID).ok_or_else(|| {
            Error::InvalidMessage(format!("Missing required attribute {}", DATA_PARTITION_ID))
        })?;

        let mut ctx = Self::new(partition_id);
        if let Some(account) = non_blank(ACCOUNT_ID) {
            ctx.account_id = account;
        }
        ctx.user = non_blank(USER);
        if let Some(correlation) = non_blank(CORRELATION_ID) {
            ctx.correlation_id = correlation;
        }
        Ok(ctx)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Attributes stamped on every outbound bus message.
    pub fn to_attributes(&self) -> HashMap<String, String> {
        HashMap::from([
            (USER.to_string(), self.user.clone().unwrap_or_default()),
            (ACCOUNT_ID.to_string(), self.account_id.clone()),
            (DATA_PARTITION_ID.to_string(), self.partition_id.clone()),
            (CORRELATION_ID.to_string(), self.correlation_id.clone()),
        ])
    }
}
