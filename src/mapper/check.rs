//! ApiCheck → Checkly API check

use kube::ResourceExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{canonical_list, numeric_id, Dependencies, Dependency, MapError, ResourceMapper};
use crate::crd::{ApiCheck, SpecValidationError};

/// Sub-minute frequencies Checkly accepts, in seconds
const SUB_MINUTE_FREQUENCIES: [u32; 3] = [10, 20, 30];

/// Minute frequencies Checkly accepts
const MINUTE_FREQUENCIES: [u32; 12] = [1, 2, 5, 10, 15, 30, 60, 120, 180, 360, 720, 1440];

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

const MAX_RESPONSE_TIME_MS: u32 = 30_000;

/// Checkly frequency: whole minutes, or minute 0 plus a seconds offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frequency {
    pub minutes: u32,
    pub offset_seconds: Option<u32>,
}

/// Parse "30s", "5m", "1h" or bare minutes into a Checkly frequency
pub fn parse_frequency(raw: &str) -> Result<Frequency, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("frequency is empty".to_string());
    }

    let (digits, unit_seconds) = match raw.char_indices().last() {
        Some((idx, 's')) => (&raw[..idx], 1),
        Some((idx, 'm')) => (&raw[..idx], 60),
        Some((idx, 'h')) => (&raw[..idx], 3600),
        _ => (raw, 60),
    };

    let value: u32 = digits
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a duration", raw))?;
    let seconds = value
        .checked_mul(unit_seconds)
        .ok_or_else(|| format!("'{}' is out of range", raw))?;

    if seconds < 60 {
        if SUB_MINUTE_FREQUENCIES.contains(&seconds) {
            return Ok(Frequency {
                minutes: 0,
                offset_seconds: Some(seconds),
            });
        }
        return Err(format!(
            "'{}' is not supported; sub-minute frequencies are 10s, 20s or 30s",
            raw
        ));
    }

    if seconds % 60 != 0 || !MINUTE_FREQUENCIES.contains(&(seconds / 60)) {
        return Err(format!(
            "'{}' is not supported; use one of {:?} minutes",
            raw, MINUTE_FREQUENCIES
        ));
    }

    Ok(Frequency {
        minutes: seconds / 60,
        offset_seconds: None,
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssertionPayload {
    pub source: String,
    pub comparison: String,
    pub property: String,
    pub target: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckRequest {
    pub method: String,
    pub url: String,
    pub follow_redirects: bool,
    pub assertions: Vec<AssertionPayload>,
}

/// Body of `POST /v1/checks/api`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckPayload {
    pub name: String,
    pub check_type: String,
    pub activated: bool,
    pub muted: bool,
    pub frequency: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_offset: Option<u32>,
    pub locations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_time: Option<u32>,
    pub tags: Vec<String>,
    pub use_global_alert_settings: bool,
    pub request: CheckRequest,
}

/// Mapper for ApiCheck resources
#[derive(Clone, Debug)]
pub struct CheckMapper {
    default_locations: Vec<String>,
}

impl CheckMapper {
    pub fn new(default_locations: Vec<String>) -> Self {
        Self {
            default_locations: canonical_list(&default_locations),
        }
    }
}

fn invalid(field: &str, message: impl Into<String>, how_to_fix: &str) -> MapError {
    MapError::Invalid(SpecValidationError::new(field, message, how_to_fix))
}

impl ResourceMapper for CheckMapper {
    type Resource = ApiCheck;
    type Representation = CheckPayload;

    fn dependencies(&self, check: &ApiCheck) -> Vec<Dependency> {
        check
            .spec
            .group
            .iter()
            .map(|g| Dependency::Group(g.clone()))
            .collect()
    }

    fn to_external(&self, check: &ApiCheck, deps: &Dependencies) -> Result<CheckPayload, MapError> {
        let spec = &check.spec;

        let url = Url::parse(spec.endpoint.trim()).map_err(|e| {
            invalid(
                "spec.endpoint",
                format!("'{}' is not a valid URL: {}", spec.endpoint, e),
                "use an absolute URL such as https://example.com/health",
            )
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(
                "spec.endpoint",
                format!("unsupported scheme '{}'", url.scheme()),
                "use an http or https URL",
            ));
        }

        let method = spec.method.trim().to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return Err(invalid(
                "spec.method",
                format!("unsupported method '{}'", spec.method),
                "use one of GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS",
            ));
        }

        let success: u16 = spec
            .success
            .trim()
            .parse()
            .ok()
            .filter(|code| (100..=599).contains(code))
            .ok_or_else(|| {
                invalid(
                    "spec.success",
                    format!("'{}' is not an HTTP status code", spec.success),
                    "set spec.success to a status code between 100 and 599",
                )
            })?;

        let frequency = parse_frequency(&spec.frequency).map_err(|message| {
            invalid(
                "spec.frequency",
                message,
                "use 10s, 20s, 30s or a supported number of minutes such as 5m",
            )
        })?;

        if let Some(max) = spec.max_response_time {
            if max == 0 || max > MAX_RESPONSE_TIME_MS {
                return Err(invalid(
                    "spec.maxResponseTime",
                    format!("{}ms is outside 1..={}", max, MAX_RESPONSE_TIME_MS),
                    "lower spec.maxResponseTime",
                ));
            }
        }

        let group_id = match &spec.group {
            Some(group) => {
                let id = deps.require(Dependency::Group(group.clone()))?;
                Some(numeric_id("spec.group", id)?)
            }
            None => None,
        };

        // Checks inside a group inherit the group's locations
        let mut locations = canonical_list(&spec.locations);
        if locations.is_empty() && group_id.is_none() {
            locations = self.default_locations.clone();
        }

        let mut assertions = vec![AssertionPayload {
            source: "STATUS_CODE".to_string(),
            comparison: "EQUALS".to_string(),
            property: String::new(),
            target: success.to_string(),
        }];
        for (idx, assertion) in spec.assertions.iter().enumerate() {
            if assertion.source.trim().is_empty() || assertion.comparison.trim().is_empty() {
                return Err(invalid(
                    &format!("spec.assertions[{}]", idx),
                    "source and comparison are required",
                    "set both source and comparison",
                ));
            }
            assertions.push(AssertionPayload {
                source: assertion.source.trim().to_ascii_uppercase(),
                comparison: assertion.comparison.trim().to_ascii_uppercase(),
                property: assertion.property.clone(),
                target: assertion.target.clone(),
            });
        }

        Ok(CheckPayload {
            name: check.name_any(),
            check_type: "API".to_string(),
            activated: spec.activated,
            muted: spec.muted,
            frequency: frequency.minutes,
            frequency_offset: frequency.offset_seconds,
            locations,
            group_id,
            max_response_time: spec.max_response_time,
            tags: canonical_list(&spec.tags),
            use_global_alert_settings: group_id.is_none(),
            request: CheckRequest {
                method,
                url: spec.endpoint.trim().to_string(),
                follow_redirects: true,
                assertions,
            },
        })
    }

    fn normalize(&self, mut payload: CheckPayload) -> CheckPayload {
        if payload.frequency_offset == Some(0) {
            payload.frequency_offset = None;
        }
        payload.locations = canonical_list(&payload.locations);
        payload.tags = canonical_list(&payload.tags);
        payload
    }
}
