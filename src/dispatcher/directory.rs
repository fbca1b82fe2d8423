//! Recipient directory used to expand role/group filters.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AppError;
use crate::store::Recipient;

use super::RecipientFilter;

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Expand a filter into concrete recipients, in directory order.
    async fn resolve(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>, AppError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    #[serde(flatten)]
    pub recipient: Recipient,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl DirectoryEntry {
    fn matches(&self, filter: &RecipientFilter) -> bool {
        let role_ok = filter
            .role
            .as_ref()
            .map_or(true, |role| self.roles.iter().any(|r| r == role));
        let group_ok = filter
            .group
            .as_ref()
            .map_or(true, |group| self.groups.iter().any(|g| g == group));
        role_ok && group_ok
    }
}

/// Fixed in-process directory, optionally loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON array of entries:
    /// `[{"id": "u1", "address": "a@x.io", "roles": ["admin"], "groups": []}]`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Internal(format!("cannot read directory {}: {}", path.display(), e))
        })?;
        let entries: Vec<DirectoryEntry> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Internal(format!("invalid directory {}: {}", path.display(), e))
        })?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn resolve(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>, AppError> {
        if filter.is_empty() {
            return Err(AppError::Validation(
                "recipient filter must name a role or a group".to_string(),
            ));
        }
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.matches(filter))
            .map(|entry| entry.recipient.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn directory() -> StaticDirectory {
        let entries: Vec<DirectoryEntry> = serde_json::from_value(json!([
            { "id": "u1", "address": "ann@example.com", "roles": ["admin"], "groups": ["ops"] },
            { "id": "u2", "address": "bob@example.com", "roles": ["member"], "groups": ["ops"] },
            { "id": "u3", "address": "cid@example.com", "roles": ["admin"] }
        ]))
        .unwrap();
        StaticDirectory::new(entries)
    }

    fn ids(recipients: Vec<Recipient>) -> Vec<String> {
        recipients.into_iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn test_filter_by_role() {
        let filter = RecipientFilter {
            role: Some("admin".into()),
            group: None,
        };
        assert_eq!(ids(directory().resolve(&filter).await.unwrap()), ["u1", "u3"]);
    }

    #[tokio::test]
    async fn test_filter_by_role_and_group() {
        let filter = RecipientFilter {
            role: Some("admin".into()),
            group: Some("ops".into()),
        };
        assert_eq!(ids(directory().resolve(&filter).await.unwrap()), ["u1"]);
    }

    #[tokio::test]
    async fn test_empty_filter_rejected() {
        let result = directory().resolve(&RecipientFilter::default()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let filter = RecipientFilter {
            role: None,
            group: Some("nobody".into()),
        };
        assert!(directory().resolve(&filter).await.unwrap().is_empty());
    }
}
