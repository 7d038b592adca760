// Copyright 2025 Fleetctl Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The filter predicate (spec §4.5): decides whether a client record
//! satisfies a command's filter.

use std::{collections::HashMap, net::IpAddr};

use fleetc_protocol::{ClientInfo, Filter};
use ipnet::IpNet;

use crate::registry::ClientRecord;

/// Whatever a filter can be evaluated against: the server's view of a
/// connected client ([`ClientRecord`]) or an agent's view of itself
/// ([`ClientInfo`]). Letting both sides share one evaluator is what lets
/// an agent re-check a command's filter against its own identity rather
/// than blindly trusting the server already did (spec §4.10).
pub trait FilterSubject {
    fn subject_uuid(&self) -> &str;
    fn subject_hostname(&self) -> &str;
    fn subject_arch(&self) -> &str;
    fn subject_os(&self) -> &str;
    fn subject_ips(&self) -> &[String];
    fn subject_macs(&self) -> &[String];
    fn subject_tags(&self) -> &HashMap<String, String>;
}

impl FilterSubject for ClientRecord {
    fn subject_uuid(&self) -> &str {
        &self.uuid
    }
    fn subject_hostname(&self) -> &str {
        &self.hostname
    }
    fn subject_arch(&self) -> &str {
        &self.arch
    }
    fn subject_os(&self) -> &str {
        &self.os
    }
    fn subject_ips(&self) -> &[String] {
        &self.ips
    }
    fn subject_macs(&self) -> &[String] {
        &self.macs
    }
    fn subject_tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

impl FilterSubject for ClientInfo {
    fn subject_uuid(&self) -> &str {
        &self.uuid
    }
    fn subject_hostname(&self) -> &str {
        &self.hostname
    }
    fn subject_arch(&self) -> &str {
        &self.arch
    }
    fn subject_os(&self) -> &str {
        &self.os
    }
    fn subject_ips(&self) -> &[String] {
        &self.ips
    }
    fn subject_macs(&self) -> &[String] {
        &self.macs
    }
    fn subject_tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

/// A [`Filter`] with its `ip` field pre-parsed as either a literal
/// address or a CIDR block (spec §9: "cache parsed CIDR networks on the
/// filter"). Cheap to build and reused across every client a command is
/// tested against.
pub struct CompiledFilter {
    filter: Filter,
    ip_match: Option<IpMatch>,
}

enum IpMatch {
    Exact(IpAddr),
    Cidr(IpNet),
}

impl CompiledFilter {
    pub fn compile(filter: Filter) -> CompiledFilter {
        let ip_match = filter.ip.as_deref().and_then(parse_ip_field);
        CompiledFilter { filter, ip_match }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Evaluate the filter against a subject. Matching is idempotent by
    /// construction: it only reads `subject` and `self`, never mutates
    /// either (spec §8's idempotence property).
    pub fn matches(&self, subject: &impl FilterSubject) -> bool {
        if self.filter.is_empty() {
            return true;
        }

        if let Some(want) = &self.filter.uuid {
            if !want.eq_ignore_ascii_case(subject.subject_uuid()) {
                return false;
            }
        }
        if let Some(want) = &self.filter.hostname {
            if want != subject.subject_hostname() {
                return false;
            }
        }
        if let Some(want) = &self.filter.arch {
            if want != subject.subject_arch() {
                return false;
            }
        }
        if let Some(want) = &self.filter.os {
            if want != subject.subject_os() {
                return false;
            }
        }
        if let Some(want) = &self.filter.mac {
            if !subject.subject_macs().iter().any(|m| m == want) {
                return false;
            }
        }
        if self.filter.ip.is_some() {
            match &self.ip_match {
                Some(m) => {
                    if !subject.subject_ips().iter().any(|ip| ip_matches(m, ip)) {
                        return false;
                    }
                }
                // an unparseable ip field never matches anything
                None => return false,
            }
        }
        for (k, v) in &self.filter.tags {
            match subject.subject_tags().get(k) {
                Some(have) if have == v => {}
                _ => return false,
            }
        }

        true
    }
}

/// One-shot evaluation for callers that don't want to keep a compiled
/// filter around (e.g. a single ad-hoc match in a test).
pub fn matches(filter: &Filter, subject: &impl FilterSubject) -> bool {
    CompiledFilter::compile(filter.clone()).matches(subject)
}

fn parse_ip_field(raw: &str) -> Option<IpMatch> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(IpMatch::Cidr(net));
    }
    if let Ok(addr) = raw.parse::<IpAddr>() {
        return Some(IpMatch::Exact(addr));
    }
    None
}

fn ip_matches(m: &IpMatch, candidate: &str) -> bool {
    let Ok(candidate) = candidate.parse::<IpAddr>() else {
        return false;
    };
    match m {
        IpMatch::Exact(want) => *want == candidate,
        IpMatch::Cidr(net) => net.contains(&candidate),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn client(os: &str, ips: &[&str], tags: &[(&str, &str)]) -> ClientRecord {
        let mut c = ClientRecord::new_for_test("11111111-1111-1111-1111-111111111111");
        c.os = os.to_string();
        c.ips = ips.iter().map(|s| s.to_string()).collect();
        c.tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>();
        c
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::default();
        let c = client("linux", &[], &[]);
        assert!(matches(&f, &c));
    }

    #[test]
    fn tag_filter_requires_exact_match() {
        let f = Filter { tags: [("role".to_string(), "edge".to_string())].into(), ..Default::default() };
        assert!(matches(&f, &client("linux", &[], &[("role", "edge")])));
        assert!(!matches(&f, &client("linux", &[], &[("role", "core")])));
        assert!(!matches(&f, &client("linux", &[], &[])));
    }

    #[test]
    fn cidr_filter() {
        let f = Filter { ip: Some("10.0.0.0/24".to_string()), ..Default::default() };
        assert!(matches(&f, &client("linux", &["10.0.0.5"], &[])));
        assert!(!matches(&f, &client("linux", &["10.0.1.5"], &[])));
    }

    #[test]
    fn literal_ip_filter() {
        let f = Filter { ip: Some("10.0.0.5".to_string()), ..Default::default() };
        assert!(matches(&f, &client("linux", &["10.0.0.5"], &[])));
        assert!(!matches(&f, &client("linux", &["10.0.0.6"], &[])));
    }

    #[test]
    fn combined_os_and_tag_filter_end_to_end_scenario() {
        // spec §8 scenario 1
        let f = Filter {
            os: Some("linux".to_string()),
            tags: [("role".to_string(), "edge".to_string())].into(),
            ..Default::default()
        };
        let a = client("linux", &[], &[("role", "edge")]);
        let b = client("linux", &[], &[("role", "core")]);
        let c = client("windows", &[], &[("role", "edge")]);
        assert!(matches(&f, &a));
        assert!(!matches(&f, &b));
        assert!(!matches(&f, &c));
    }

    #[test]
    fn uuid_match_is_case_insensitive() {
        let f = Filter { uuid: Some("11111111-1111-1111-1111-111111111111".to_uppercase()), ..Default::default() };
        assert!(matches(&f, &client("linux", &[], &[])));
    }

    #[test]
    fn idempotent_repeated_evaluation() {
        let f = Filter { os: Some("linux".to_string()), ..Default::default() };
        let c = client("linux", &[], &[]);
        let compiled = CompiledFilter::compile(f);
        for _ in 0..5 {
            assert!(compiled.matches(&c));
        }
    }
}
