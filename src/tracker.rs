//! # Issue tracker
//!
//! [`IssueTracker`] is the seam through which mdk reads and updates tracker
//! issues. [`JiraClient`] implements it against the Jira REST API v2 with
//! basic authentication.
//!
//! Custom fields are addressed by their display name. Jira returns fields
//! keyed by opaque ids (`customfield_10100`) along with a `names` index when
//! asked to `expand=names`; [`Issue`] keeps both views.
//!
//! The client is constructed explicitly and passed down; callers that look the
//! same issue up several times in one run memoise the results themselves.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::branch;
use crate::config::Config;
use crate::error::{Error, Result};

pub const ISSUE_PREFIX: &str = "MDL";
pub const API_PATH: &str = "rest/api/2/";
pub const PASSWORD_ENV: &str = "MDK_TRACKER_PASSWORD";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PATCH_EXTENSION: &str = ".patch";
/// Every field but the comments.
pub const ALL_FIELDS: &str = "*all,-comment";

/// `12345` is `MDL-12345`; keys with a project prefix are upper-cased.
pub fn normalize_issue_key(key: &str) -> String {
    let key = key.trim();
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_digit()) {
        format!("{}-{}", ISSUE_PREFIX, key)
    } else {
        key.to_ascii_uppercase()
    }
}

/// A file attached to an issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub mime_type: Option<String>,
}

impl Attachment {
    fn from_json(value: &Value) -> Option<Self> {
        let id = match value.get("id")? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(Self {
            id,
            filename: value.get("filename")?.as_str()?.to_string(),
            url: value.get("content")?.as_str()?.to_string(),
            size: value.get("size").and_then(Value::as_u64).unwrap_or(0),
            created: value
                .get("created")
                .and_then(Value::as_str)
                .and_then(parse_date),
            author: value
                .pointer("/author/name")
                .and_then(Value::as_str)
                .map(str::to_string),
            mime_type: value
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn is_patch(&self) -> bool {
        self.filename.ends_with(PATCH_EXTENSION)
    }
}

/// Jira dates look like `2024-01-15T10:20:30.000+0000`.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// An issue as returned by `GET issue/<key>?expand=names`.
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub key: String,
    /// Fields keyed by id.
    pub fields: Map<String, Value>,
    /// Fields keyed by display name.
    pub named: BTreeMap<String, Value>,
    /// Display name to field id.
    pub named_mapping: BTreeMap<String, String>,
}

impl Issue {
    pub fn from_json(key: &str, value: &Value) -> Self {
        let fields = value
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let names = value.get("names").and_then(Value::as_object);
        let mut named = BTreeMap::new();
        let mut named_mapping = BTreeMap::new();
        if let Some(names) = names {
            for (id, field) in &fields {
                if let Some(name) = names.get(id).and_then(Value::as_str) {
                    named.insert(name.to_string(), field.clone());
                    named_mapping.insert(name.to_string(), id.clone());
                }
            }
        }
        Self {
            key: value
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string(),
            fields,
            named,
            named_mapping,
        }
    }

    /// A named field holding a non-empty string.
    pub fn named_str(&self, name: &str) -> Option<&str> {
        self.named
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn summary(&self) -> Option<&str> {
        self.fields.get("summary").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.fields
            .get("status")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
    }

    pub fn assignee(&self) -> Option<&str> {
        self.fields
            .get("assignee")
            .and_then(|a| a.get("displayName").or_else(|| a.get("name")))
            .and_then(Value::as_str)
    }

    pub fn labels(&self) -> Vec<String> {
        self.fields
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.fields
            .get("attachment")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Attachment::from_json).collect())
            .unwrap_or_default()
    }

    pub fn is_security(&self) -> bool {
        !matches!(self.fields.get("security"), None | Some(Value::Null))
    }
}

/// Where to pull a version's branch from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullBranch {
    pub branch: Option<String>,
    pub diff_url: Option<String>,
}

/// The pull fields of an issue, organised by version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullInfo {
    pub repository: Option<String>,
    pub branches: BTreeMap<String, PullBranch>,
}

impl PullInfo {
    /// Read the fields named by `tracker.fieldnames`:
    /// `repositoryurl` plus one `{branch, diffurl}` entry per version.
    pub fn from_issue(issue: &Issue, fieldnames: &Value) -> Self {
        let mut info = PullInfo::default();
        let Some(fieldnames) = fieldnames.as_object() else {
            return info;
        };
        for (key, value) in fieldnames {
            if key == "repositoryurl" {
                info.repository = value
                    .as_str()
                    .and_then(|name| issue.named_str(name))
                    .map(str::to_string);
            } else if branch::is_main(key) || key.chars().all(|c| c.is_ascii_digit()) {
                let field = |name: &str| {
                    value
                        .get(name)
                        .and_then(Value::as_str)
                        .and_then(|field| issue.named_str(field))
                        .map(str::to_string)
                };
                info.branches.insert(
                    branch::normalize_version(key),
                    PullBranch {
                        branch: field("branch"),
                        diff_url: field("diffurl"),
                    },
                );
            }
        }
        info
    }

    pub fn for_version(&self, version: &str) -> Option<&PullBranch> {
        self.branches.get(&branch::normalize_version(version))
    }

    /// The repository and branch to fetch for `version`, when both are set.
    pub fn remote_for(&self, version: &str) -> Option<(&str, &str)> {
        let repository = self.repository.as_deref()?;
        let branch = self.for_version(version)?.branch.as_deref()?;
        Some((repository, branch))
    }
}

/// Labels affected by a label update, and those already in the wanted state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelChanges {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Operations mdk performs on the issue tracker.
pub trait IssueTracker {
    fn get_issue(&self, key: &str, fields: &str) -> Result<Issue>;

    fn get_attachments(&self, key: &str) -> Result<Vec<Attachment>> {
        Ok(self.get_issue(key, "attachment")?.attachments())
    }

    fn get_pull_info(&self, key: &str) -> Result<PullInfo> {
        Ok(self.pull_info_of(&self.get_issue(key, ALL_FIELDS)?))
    }

    /// The pull fields of an issue already fetched with [`ALL_FIELDS`].
    fn pull_info_of(&self, issue: &Issue) -> PullInfo;

    fn is_security_issue(&self, key: &str) -> Result<bool> {
        Ok(self.get_issue(key, "security")?.is_security())
    }

    /// Set text custom fields by display name; unchanged values are skipped.
    fn set_custom_fields(&self, key: &str, updates: &BTreeMap<String, String>) -> Result<()>;
    fn add_labels(&self, key: &str, labels: &[String]) -> Result<LabelChanges>;
    fn remove_labels(&self, key: &str, labels: &[String]) -> Result<LabelChanges>;
    fn add_comment(&self, key: &str, text: &str) -> Result<()>;
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
    fn upload(&self, key: &str, file: &Path) -> Result<()>;
    fn delete_attachment(&self, id: &str) -> Result<()>;
}

/// A Jira server.
#[derive(Debug, Clone)]
pub struct JiraClient {
    http: Client,
    base: Url,
    username: String,
    password: Option<String>,
    fieldnames: Value,
}

impl JiraClient {
    pub fn new(
        url: &str,
        username: impl Into<String>,
        password: Option<String>,
        fieldnames: Value,
    ) -> Result<Self> {
        let base = Url::parse(&format!("{}/", url.trim_end_matches('/')))?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            username: username.into(),
            password: password.filter(|p| !p.is_empty()),
            fieldnames,
        })
    }

    /// Build from `tracker.*`; the password comes from the environment first.
    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config.get_string("tracker.url")?;
        let username = config.get_str("tracker.username").unwrap_or("").to_string();
        let password = std::env::var(PASSWORD_ENV)
            .ok()
            .or_else(|| config.get_str("tracker.password").map(str::to_string));
        let fieldnames = config
            .get("tracker.fieldnames")
            .cloned()
            .unwrap_or(Value::Null);
        Self::new(&url, username, password, fieldnames)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && self.password.is_some()
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(API_PATH)?.join(path.trim_start_matches('/'))?)
    }

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, self.password.as_deref())
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.authenticate(request).send().map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    operation: what.to_string(),
                }
            } else if e.is_connect() {
                Error::TrackerUnavailable {
                    message: e.to_string(),
                }
            } else {
                Error::Http(e)
            }
        })?;
        log::debug!("{} -> {}", what, response.status());
        if response.status() == StatusCode::FORBIDDEN
            || response.status() == StatusCode::UNAUTHORIZED
        {
            return Err(Error::TrackerRequest {
                message: format!("{} request not authorized: {}", response.status().as_u16(), what),
            });
        }
        Ok(response)
    }

    fn expect(response: Response, expected: StatusCode, what: &str) -> Result<Response> {
        if response.status() != expected {
            return Err(Error::TrackerRequest {
                message: format!("{}: unexpected status {}", what, response.status().as_u16()),
            });
        }
        Ok(response)
    }

    fn update_issue(&self, key: &str, body: &Value) -> Result<()> {
        let url = self.api_url(&format!("issue/{}", key))?;
        let what = format!("PUT issue/{}", key);
        let response = self.send(self.http.put(url).json(body), &what)?;
        Self::expect(response, StatusCode::NO_CONTENT, &what)?;
        Ok(())
    }

    fn set_labels(&self, key: &str, labels: &[String]) -> Result<()> {
        self.update_issue(key, &json!({"fields": {"labels": labels}}))
    }
}

impl IssueTracker for JiraClient {
    fn get_issue(&self, key: &str, fields: &str) -> Result<Issue> {
        let url = self.api_url(&format!("issue/{}", key))?;
        let request = self
            .http
            .get(url)
            .query(&[("fields", fields), ("expand", "names")]);
        let response = self.send(request, &format!("GET issue/{}", key))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::TrackerIssueNotFound {
                key: key.to_string(),
            }),
            status if !status.is_success() => Err(Error::TrackerUnavailable {
                message: format!("unexpected status {} for {}", status.as_u16(), key),
            }),
            _ => {
                let value: Value = response.json()?;
                Ok(Issue::from_json(key, &value))
            }
        }
    }

    fn pull_info_of(&self, issue: &Issue) -> PullInfo {
        PullInfo::from_issue(issue, &self.fieldnames)
    }

    fn set_custom_fields(&self, key: &str, updates: &BTreeMap<String, String>) -> Result<()> {
        let issue = self.get_issue(key, ALL_FIELDS)?;
        let mut fields = Map::new();
        for (name, value) in updates {
            if issue.named_str(name) == Some(value.as_str()) {
                continue;
            }
            let id = issue
                .named_mapping
                .get(name)
                .ok_or_else(|| Error::TrackerRequest {
                    message: format!("could not find the field named '{}'", name),
                })?;
            fields.insert(id.clone(), Value::String(value.clone()));
        }
        if fields.is_empty() {
            log::info!("No updates required on {}", key);
            return Ok(());
        }
        self.update_issue(key, &json!({ "fields": fields }))
    }

    fn add_labels(&self, key: &str, labels: &[String]) -> Result<LabelChanges> {
        let mut current = self.get_issue(key, "labels")?.labels();
        let mut changes = LabelChanges::default();
        for label in labels {
            if current.contains(label) {
                changes.unchanged.push(label.clone());
            } else {
                current.push(label.clone());
                changes.changed.push(label.clone());
            }
        }
        if !changes.changed.is_empty() {
            self.set_labels(key, &current)?;
        }
        Ok(changes)
    }

    fn remove_labels(&self, key: &str, labels: &[String]) -> Result<LabelChanges> {
        let mut current = self.get_issue(key, "labels")?.labels();
        let mut changes = LabelChanges::default();
        for label in labels {
            match current.iter().position(|l| l == label) {
                Some(index) => {
                    current.remove(index);
                    changes.changed.push(label.clone());
                }
                None => changes.unchanged.push(label.clone()),
            }
        }
        if !changes.changed.is_empty() {
            self.set_labels(key, &current)?;
        }
        Ok(changes)
    }

    fn add_comment(&self, key: &str, text: &str) -> Result<()> {
        let url = self.api_url(&format!("issue/{}/comment", key))?;
        let what = format!("POST issue/{}/comment", key);
        let response = self.send(self.http.post(url).json(&json!({ "body": text })), &what)?;
        Self::expect(response, StatusCode::CREATED, &what)?;
        Ok(())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let what = format!("GET {}", url);
        let response = self.send(self.http.get(url), &what)?;
        let response = Self::expect(response, StatusCode::OK, &what)?;
        let bytes = response.bytes()?;
        fs::write(dest, &bytes)?;
        Ok(())
    }

    fn upload(&self, key: &str, file: &Path) -> Result<()> {
        let url = self.api_url(&format!("issue/{}/attachments", key))?;
        let form = reqwest::blocking::multipart::Form::new().file("file", file)?;
        let what = format!("POST issue/{}/attachments", key);
        let request = self
            .http
            .post(url)
            .header("X-Atlassian-Token", "nocheck")
            .multipart(form);
        let response = self.send(request, &what)?;
        Self::expect(response, StatusCode::OK, &what)?;
        Ok(())
    }

    fn delete_attachment(&self, id: &str) -> Result<()> {
        let url = self.api_url(&format!("attachment/{}", id))?;
        let what = format!("DELETE attachment/{}", id);
        let response = self.send(self.http.delete(url), &what)?;
        Self::expect(response, StatusCode::NO_CONTENT, &what)?;
        Ok(())
    }
}
