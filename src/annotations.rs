//! Monitoring intent carried by Ingress annotations
//!
//! All keys live under `<controller-domain>/`. An ingress opts in with
//! `enabled: "true"` or by naming an explicit `check-url`. Every monitored
//! endpoint gets a stable rule key (`rule-<i>` or `rule-<i>-<j>`), and any
//! field can be set ingress-wide (`<prefix><field>`) or for one endpoint
//! (`<prefix><rule-key>.<field>`); the per-rule value wins.
//!
//! Scanning is a pure function of the annotations and rules.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use reqwest::Url;

use crate::crd::{ApiCheckSpec, Assertion};
use crate::mapper::parse_frequency;

pub const DEFAULT_DOMAIN: &str = "k8s.checklyhq.com";

pub const ENABLED: &str = "enabled";
pub const CHECK_URL: &str = "check-url";
pub const ENDPOINT: &str = "endpoint";
pub const PATH: &str = "path";
pub const FREQUENCY: &str = "frequency";
pub const SUCCESS: &str = "success";
pub const MUTED: &str = "muted";
pub const GROUP: &str = "group";
pub const LOCATIONS: &str = "locations";
pub const MAX_RESPONSE_TIME: &str = "max-response-time";
pub const ASSERTIONS: &str = "assertions";

/// One host rule of an ingress
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressRuleSource {
    pub host: Option<String>,
    pub paths: Vec<String>,
}

/// The parts of an Ingress the scanner and synchronizer look at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressSource {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub rules: Vec<IngressRuleSource>,
    pub tls_hosts: BTreeSet<String>,
    pub being_deleted: bool,
}

impl From<&Ingress> for IngressSource {
    fn from(ingress: &Ingress) -> Self {
        let spec = ingress.spec.as_ref();
        let rules = spec
            .and_then(|s| s.rules.as_ref())
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| IngressRuleSource {
                        host: rule.host.clone().filter(|h| !h.is_empty()),
                        paths: rule
                            .http
                            .as_ref()
                            .map(|http| {
                                http.paths
                                    .iter()
                                    .map(|p| p.path.clone().unwrap_or_else(|| "/".to_string()))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let tls_hosts = spec
            .and_then(|s| s.tls.as_ref())
            .map(|tls| {
                tls.iter()
                    .flat_map(|t| t.hosts.iter().flatten().cloned())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: ingress.name_any(),
            namespace: ingress.namespace().unwrap_or_default(),
            uid: ingress.uid(),
            annotations: ingress.annotations().clone(),
            rules,
            tls_hosts,
            being_deleted: ingress.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Desired ApiCheck for one monitored endpoint
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateCheck {
    pub rule_key: String,
    pub spec: ApiCheckSpec,
}

/// An endpoint dropped because one of its annotation values is malformed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedRule {
    pub rule_key: String,
    pub annotation: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResult {
    pub candidates: Vec<CandidateCheck>,
    pub rejected: Vec<RejectedRule>,
}

impl ScanResult {
    pub fn rule_keys(&self) -> BTreeSet<&str> {
        self.candidates.iter().map(|c| c.rule_key.as_str()).collect()
    }
}

struct Endpoint {
    rule_key: String,
    url: String,
}

#[derive(Clone, Debug)]
pub struct AnnotationScanner {
    prefix: String,
}

impl Default for AnnotationScanner {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

impl AnnotationScanner {
    pub fn new(domain: &str) -> Self {
        Self {
            prefix: format!("{}/", domain.trim().trim_end_matches('/')),
        }
    }

    /// `<domain>/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fully qualified annotation or label key
    pub fn key(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    pub fn is_enabled(&self, annotations: &BTreeMap<String, String>) -> bool {
        annotations
            .get(&self.key(ENABLED))
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
            || annotations.contains_key(&self.key(CHECK_URL))
    }

    pub fn scan(&self, source: &IngressSource) -> ScanResult {
        let mut result = ScanResult::default();
        if !self.is_enabled(&source.annotations) {
            return result;
        }

        for endpoint in self.endpoints(source) {
            match self.candidate(&source.annotations, endpoint) {
                Ok(candidate) => result.candidates.push(candidate),
                Err(rejected) => result.rejected.push(rejected),
            }
        }
        result
    }

    fn endpoints(&self, source: &IngressSource) -> Vec<Endpoint> {
        let annotations = &source.annotations;
        if let Some(url) = annotations.get(&self.key(CHECK_URL)) {
            return vec![Endpoint {
                rule_key: "rule-0".to_string(),
                url: url.trim().to_string(),
            }];
        }

        let mut endpoints = Vec::new();
        for (i, rule) in source.rules.iter().enumerate() {
            let paths = if rule.paths.is_empty() {
                vec!["/".to_string()]
            } else {
                rule.paths.clone()
            };
            for (j, path) in paths.iter().enumerate() {
                let rule_key = if j == 0 {
                    format!("rule-{}", i)
                } else {
                    format!("rule-{}-{}", i, j)
                };
                let host = self
                    .lookup(annotations, &rule_key, ENDPOINT)
                    .map(|(_, v)| v.trim().to_string())
                    .or_else(|| rule.host.clone());
                let Some(host) = host.filter(|h| !h.is_empty()) else {
                    continue;
                };
                let path = self
                    .lookup(annotations, &rule_key, PATH)
                    .map(|(_, v)| v.trim().to_string())
                    .unwrap_or_else(|| path.clone());
                let scheme = if source.tls_hosts.contains(&host) {
                    "https"
                } else {
                    "http"
                };
                let path = if path.starts_with('/') {
                    path
                } else {
                    format!("/{}", path)
                };
                endpoints.push(Endpoint {
                    rule_key,
                    url: format!("{}://{}{}", scheme, host, path),
                });
            }
        }
        endpoints
    }

    /// Per-rule value first, then the ingress-wide one
    fn lookup<'a>(
        &self,
        annotations: &'a BTreeMap<String, String>,
        rule_key: &str,
        field: &str,
    ) -> Option<(String, &'a str)> {
        let per_rule = self.key(&format!("{}.{}", rule_key, field));
        if let Some(value) = annotations.get(&per_rule) {
            return Some((per_rule, value.as_str()));
        }
        let wide = self.key(field);
        annotations.get(&wide).map(|value| (wide, value.as_str()))
    }

    fn candidate(
        &self,
        annotations: &BTreeMap<String, String>,
        endpoint: Endpoint,
    ) -> Result<CandidateCheck, RejectedRule> {
        let rule_key = endpoint.rule_key;
        let reject = |annotation: String, message: String| RejectedRule {
            rule_key: rule_key.clone(),
            annotation,
            message,
        };

        match Url::parse(&endpoint.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => {
                return Err(reject(
                    self.key(CHECK_URL),
                    format!("unsupported scheme '{}'", url.scheme()),
                ))
            }
            Err(e) => {
                return Err(reject(
                    self.key(CHECK_URL),
                    format!("'{}' is not a valid URL: {}", endpoint.url, e),
                ))
            }
        }

        let mut spec = ApiCheckSpec::for_endpoint(&endpoint.url);

        if let Some((key, value)) = self.lookup(annotations, &rule_key, FREQUENCY) {
            parse_frequency(value).map_err(|message| reject(key, message))?;
            spec.frequency = value.trim().to_string();
        }

        if let Some((key, value)) = self.lookup(annotations, &rule_key, SUCCESS) {
            match value.trim().parse::<u16>() {
                Ok(code) if (100..=599).contains(&code) => spec.success = code.to_string(),
                _ => return Err(reject(key, format!("'{}' is not an HTTP status code", value))),
            }
        }

        if let Some((key, value)) = self.lookup(annotations, &rule_key, MUTED) {
            spec.muted = parse_bool(value).ok_or_else(|| {
                reject(key, format!("'{}' is not a boolean", value))
            })?;
        }

        if let Some((key, value)) = self.lookup(annotations, &rule_key, GROUP) {
            let group = value.trim();
            if group.is_empty() {
                return Err(reject(key, "group name is empty".to_string()));
            }
            spec.group = Some(group.to_string());
        }

        if let Some((_, value)) = self.lookup(annotations, &rule_key, LOCATIONS) {
            spec.locations = value
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some((key, value)) = self.lookup(annotations, &rule_key, MAX_RESPONSE_TIME) {
            match value.trim().parse::<u32>() {
                Ok(ms) if (1..=30_000).contains(&ms) => spec.max_response_time = Some(ms),
                _ => {
                    return Err(reject(
                        key,
                        format!("'{}' is not a response time between 1 and 30000 ms", value),
                    ))
                }
            }
        }

        if let Some((key, value)) = self.lookup(annotations, &rule_key, ASSERTIONS) {
            spec.assertions = parse_assertions(value).map_err(|message| reject(key, message))?;
        }

        Ok(CandidateCheck { rule_key, spec })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// `source:comparison:target` entries separated by `;`
fn parse_assertions(raw: &str) -> Result<Vec<Assertion>, String> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(source), Some(comparison), Some(target))
                    if !source.trim().is_empty() && !comparison.trim().is_empty() =>
                {
                    Ok(Assertion {
                        source: source.trim().to_ascii_uppercase(),
                        comparison: comparison.trim().to_ascii_uppercase(),
                        property: String::new(),
                        target: target.trim().to_string(),
                    })
                }
                _ => Err(format!(
                    "'{}' is not of the form source:comparison:target",
                    entry
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(annotations: &[(&str, &str)], rules: Vec<IngressRuleSource>) -> IngressSource {
        IngressSource {
            name: "ingress-b".to_string(),
            namespace: "default".to_string(),
            uid: Some("uid-1".to_string()),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            rules,
            ..Default::default()
        }
    }

    fn rule(host: &str, paths: &[&str]) -> IngressRuleSource {
        IngressRuleSource {
            host: Some(host.to_string()),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_check_url_yields_single_rule() {
        let scan = AnnotationScanner::default().scan(&source(
            &[("k8s.checklyhq.com/check-url", "https://b.example")],
            vec![rule("ignored.example", &["/a", "/b"])],
        ));
        assert!(scan.rejected.is_empty());
        assert_eq!(scan.candidates.len(), 1);
        assert_eq!(scan.candidates[0].rule_key, "rule-0");
        assert_eq!(scan.candidates[0].spec.endpoint, "https://b.example");
    }

    #[test]
    fn test_ingress_without_annotations_is_ignored() {
        let scanner = AnnotationScanner::default();
        assert!(scanner
            .scan(&source(&[], vec![rule("a.example", &["/"])]))
            .candidates
            .is_empty());
        assert!(scanner
            .scan(&source(
                &[("k8s.checklyhq.com/enabled", "false")],
                vec![rule("a.example", &["/"])]
            ))
            .candidates
            .is_empty());
        // Another domain's annotations are not ours
        assert!(scanner
            .scan(&source(
                &[("example.com/enabled", "true")],
                vec![rule("a.example", &["/"])]
            ))
            .candidates
            .is_empty());
    }

    #[test]
    fn test_rules_and_paths_become_endpoints() {
        let mut src = source(
            &[("k8s.checklyhq.com/enabled", "true")],
            vec![
                rule("a.example", &["/", "/api"]),
                IngressRuleSource {
                    host: None,
                    paths: vec!["/nohost".to_string()],
                },
                rule("c.example", &[]),
            ],
        );
        src.tls_hosts.insert("a.example".to_string());

        let scan = AnnotationScanner::default().scan(&src);
        let endpoints: Vec<(&str, &str)> = scan
            .candidates
            .iter()
            .map(|c| (c.rule_key.as_str(), c.spec.endpoint.as_str()))
            .collect();
        assert_eq!(
            endpoints,
            vec![
                ("rule-0", "https://a.example/"),
                ("rule-0-1", "https://a.example/api"),
                ("rule-2", "http://c.example/"),
            ]
        );
    }

    #[test]
    fn test_path_and_endpoint_overrides() {
        let scan = AnnotationScanner::default().scan(&source(
            &[
                ("k8s.checklyhq.com/enabled", "true"),
                ("k8s.checklyhq.com/path", "healthz"),
                ("k8s.checklyhq.com/endpoint", "internal.example"),
            ],
            vec![rule("a.example", &["/"])],
        ));
        assert_eq!(scan.candidates[0].spec.endpoint, "http://internal.example/healthz");
    }

    #[test]
    fn test_per_rule_annotation_wins_over_ingress_wide() {
        let scan = AnnotationScanner::default().scan(&source(
            &[
                ("k8s.checklyhq.com/enabled", "true"),
                ("k8s.checklyhq.com/frequency", "10m"),
                ("k8s.checklyhq.com/rule-1.frequency", "30s"),
                ("k8s.checklyhq.com/locations", "eu-west-1, us-east-1"),
            ],
            vec![rule("a.example", &["/"]), rule("b.example", &["/"])],
        ));
        assert_eq!(scan.candidates.len(), 2);
        assert_eq!(scan.candidates[0].spec.frequency, "10m");
        assert_eq!(scan.candidates[1].spec.frequency, "30s");
        for candidate in &scan.candidates {
            assert_eq!(candidate.spec.locations, vec!["eu-west-1", "us-east-1"]);
        }
    }

    #[test]
    fn test_defaults_apply_without_overrides() {
        let scan = AnnotationScanner::default().scan(&source(
            &[("k8s.checklyhq.com/enabled", "true")],
            vec![rule("a.example", &["/"])],
        ));
        let spec = &scan.candidates[0].spec;
        assert_eq!(spec.frequency, "5m");
        assert_eq!(spec.success, "200");
        assert!(!spec.muted);
        assert_eq!(spec.group, None);
    }

    #[test]
    fn test_malformed_value_excludes_only_that_rule() {
        let scan = AnnotationScanner::default().scan(&source(
            &[
                ("k8s.checklyhq.com/enabled", "true"),
                ("k8s.checklyhq.com/rule-0.frequency", "every now and then"),
            ],
            vec![rule("a.example", &["/"]), rule("b.example", &["/"])],
        ));
        assert_eq!(scan.rule_keys(), BTreeSet::from(["rule-1"]));
        assert_eq!(scan.rejected.len(), 1);
        assert_eq!(scan.rejected[0].rule_key, "rule-0");
        assert_eq!(scan.rejected[0].annotation, "k8s.checklyhq.com/rule-0.frequency");
    }

    #[test]
    fn test_field_parsing() {
        let scan = AnnotationScanner::default().scan(&source(
            &[
                ("k8s.checklyhq.com/check-url", "https://b.example/status"),
                ("k8s.checklyhq.com/success", "204"),
                ("k8s.checklyhq.com/muted", "TRUE"),
                ("k8s.checklyhq.com/group", "core"),
                ("k8s.checklyhq.com/max-response-time", "2000"),
                (
                    "k8s.checklyhq.com/assertions",
                    "text_body:contains:ok; headers:equals:x-a:b",
                ),
            ],
            vec![],
        ));
        let spec = &scan.candidates[0].spec;
        assert_eq!(spec.success, "204");
        assert!(spec.muted);
        assert_eq!(spec.group.as_deref(), Some("core"));
        assert_eq!(spec.max_response_time, Some(2000));
        assert_eq!(spec.assertions.len(), 2);
        assert_eq!(spec.assertions[0].source, "TEXT_BODY");
        assert_eq!(spec.assertions[1].target, "x-a:b");
    }

    #[test]
    fn test_invalid_check_url_is_rejected() {
        let scan = AnnotationScanner::default().scan(&source(
            &[("k8s.checklyhq.com/check-url", "ftp://b.example")],
            vec![],
        ));
        assert!(scan.candidates.is_empty());
        assert_eq!(scan.rejected[0].rule_key, "rule-0");
    }

    #[test]
    fn test_custom_domain() {
        let scanner = AnnotationScanner::new("monitoring.example.com/");
        assert_eq!(scanner.prefix(), "monitoring.example.com/");
        let scan = scanner.scan(&source(
            &[("monitoring.example.com/check-url", "https://b.example")],
            vec![],
        ));
        assert_eq!(scan.candidates.len(), 1);
    }

    #[test]
    fn test_from_ingress() {
        let ingress: Ingress = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "web",
                "namespace": "shop",
                "uid": "1234",
                "annotations": { "k8s.checklyhq.com/enabled": "true" }
            },
            "spec": {
                "tls": [{ "hosts": ["shop.example"] }],
                "rules": [{
                    "host": "shop.example",
                    "http": { "paths": [
                        { "path": "/cart", "pathType": "Prefix",
                          "backend": { "service": { "name": "cart", "port": { "number": 80 } } } }
                    ]}
                }]
            }
        }))
        .unwrap();
        let src = IngressSource::from(&ingress);
        assert_eq!(src.name, "web");
        assert_eq!(src.namespace, "shop");
        assert_eq!(src.uid.as_deref(), Some("1234"));
        assert!(!src.being_deleted);
        assert_eq!(src.rules, vec![rule("shop.example", &["/cart"])]);
        assert!(src.tls_hosts.contains("shop.example"));

        let scan = AnnotationScanner::default().scan(&src);
        assert_eq!(scan.candidates[0].spec.endpoint, "https://shop.example/cart");
    }
}
