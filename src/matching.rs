//! Matching rules (RFC 2252 section 8 plus a few OpenLDAP additions).
//!
//! A rule is one normalization function and the set of comparisons it
//! supports. Comparisons the rule does not support return `None`, which the
//! filter evaluator reports as Undefined.

use crate::result::{LdapError, LdapResult};
use crate::syntax::{split_qdescrs, SyntaxRegistry, MATCHING_RULE_DESCRIPTION};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Identity,
    /// Strip leading/trailing whitespace and collapse internal runs to one space.
    Trim,
    /// `Trim` plus lowercasing.
    CaseFold,
    Integer,
    Boolean,
}

/// A value after normalization; comparisons happen on these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Normalized {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl Normalized {
    fn into_text(self) -> String {
        match self {
            Normalized::Bool(true) => "TRUE".to_string(),
            Normalized::Bool(false) => "FALSE".to_string(),
            Normalized::Integer(i) => i.to_string(),
            Normalized::Text(s) => s,
        }
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Normalizer {
    pub fn apply(self, value: &str) -> Normalized {
        match self {
            Normalizer::Identity => Normalized::Text(value.to_string()),
            Normalizer::Trim => Normalized::Text(collapse_whitespace(value)),
            Normalizer::CaseFold => Normalized::Text(collapse_whitespace(&value.to_lowercase())),
            Normalizer::Integer => match value.trim().parse::<i64>() {
                Ok(i) => Normalized::Integer(i),
                Err(_) => Normalized::Text(value.to_string()),
            },
            Normalizer::Boolean => match value {
                "TRUE" => Normalized::Bool(true),
                "FALSE" => Normalized::Bool(false),
                other => Normalized::Text(other.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub equality: bool,
    pub ordering: bool,
    pub substrings: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        equality: false,
        ordering: false,
        substrings: false,
    };
    pub const EQUALITY: Capabilities = Capabilities {
        equality: true,
        ordering: false,
        substrings: false,
    };
    pub const ORDERING: Capabilities = Capabilities {
        equality: false,
        ordering: true,
        substrings: false,
    };
    pub const SUBSTRINGS: Capabilities = Capabilities {
        equality: false,
        ordering: false,
        substrings: true,
    };
    pub const ALL: Capabilities = Capabilities {
        equality: true,
        ordering: true,
        substrings: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRule {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    /// Syntax OID.
    pub syntax: Option<String>,
    pub normalizer: Normalizer,
    pub capabilities: Capabilities,
}

/// Literal, in-order substring match of already-normalized operands.
fn substrings_match(value: &str, initial: Option<&str>, any: &[String], final_: Option<&str>) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match final_ {
        Some(f) => rest.ends_with(f),
        None => true,
    }
}

impl MatchingRule {
    pub fn new(oid: &str, name: &str, syntax: &str, normalizer: Normalizer, capabilities: Capabilities) -> Self {
        Self {
            oid: oid.to_string(),
            names: vec![name.to_string()],
            desc: None,
            obsolete: false,
            syntax: Some(syntax.to_string()),
            normalizer,
            capabilities,
        }
    }

    /// The rule used when an attribute has no schema-supplied rule: raw values,
    /// every comparison supported.
    pub fn default_match() -> Self {
        Self {
            oid: String::new(),
            names: Vec::new(),
            desc: None,
            obsolete: false,
            syntax: None,
            normalizer: Normalizer::Identity,
            capabilities: Capabilities::ALL,
        }
    }

    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    pub fn normalize(&self, value: &str) -> Normalized {
        self.normalizer.apply(value)
    }

    /// Parse a MatchingRuleDescription. Such rules compare raw values for
    /// equality only.
    pub fn from_def(text: &str) -> LdapResult<Self> {
        let caps = MATCHING_RULE_DESCRIPTION.captures(text).ok_or_else(|| {
            LdapError::invalid_syntax(format!("Bad MatchingRuleDescription {:?}", text))
        })?;
        Ok(Self {
            oid: caps[1].to_string(),
            names: caps.get(2).map(|m| split_qdescrs(m.as_str())).unwrap_or_default(),
            desc: caps.get(3).map(|m| m.as_str().to_string()),
            obsolete: caps.get(4).is_some(),
            syntax: Some(caps[5].to_string()),
            normalizer: Normalizer::Identity,
            capabilities: Capabilities::EQUALITY,
        })
    }

    pub fn to_def(&self) -> String {
        let mut def = format!("( {} ", self.oid);
        match self.names.as_slice() {
            [] => {}
            [one] => def.push_str(&format!("NAME '{}' ", one)),
            many => {
                def.push_str("NAME ( ");
                for n in many {
                    def.push_str(&format!("'{}' ", n));
                }
                def.push_str(") ");
            }
        }
        if let Some(desc) = &self.desc {
            def.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            def.push_str("OBSOLETE ");
        }
        if let Some(syntax) = &self.syntax {
            def.push_str(&format!("SYNTAX {} ", syntax));
        }
        def.push(')');
        def
    }

    fn any_value(&self, values: &[String], assertion: &str, accept: impl Fn(Ordering) -> bool) -> bool {
        let m = self.normalize(assertion);
        values.iter().any(|v| accept(self.normalize(v).cmp(&m)))
    }

    pub fn equality_match(&self, values: &[String], assertion: &str) -> Option<bool> {
        self.capabilities
            .equality
            .then(|| self.any_value(values, assertion, |o| o == Ordering::Equal))
    }

    pub fn greater_or_equal(&self, values: &[String], assertion: &str) -> Option<bool> {
        self.capabilities
            .ordering
            .then(|| self.any_value(values, assertion, |o| o != Ordering::Less))
    }

    pub fn less_or_equal(&self, values: &[String], assertion: &str) -> Option<bool> {
        self.capabilities
            .ordering
            .then(|| self.any_value(values, assertion, |o| o != Ordering::Greater))
    }

    pub fn substrings(
        &self,
        values: &[String],
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> Option<bool> {
        if !self.capabilities.substrings {
            return None;
        }
        let norm = |s: &str| self.normalize(s).into_text();
        let initial = initial.map(norm);
        let any: Vec<String> = any.iter().map(|s| norm(s)).collect();
        let final_ = final_.map(norm);
        Some(values.iter().any(|v| {
            substrings_match(&norm(v), initial.as_deref(), &any, final_.as_deref())
        }))
    }
}

/// Matching rules keyed by OID and by lowercased name.
#[derive(Debug, Clone, Default)]
pub struct MatchingRuleRegistry {
    by_key: HashMap<String, Arc<MatchingRule>>,
    rules: Vec<Arc<MatchingRule>>,
}

impl MatchingRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: MatchingRule) -> Arc<MatchingRule> {
        let rule = Arc::new(rule);
        self.by_key.insert(rule.oid.clone(), rule.clone());
        for name in &rule.names {
            self.by_key.insert(name.to_lowercase(), rule.clone());
        }
        self.rules.push(rule.clone());
        rule
    }

    /// Look up by OID or (case-insensitive) name. Unknown rules are `None`.
    pub fn find(&self, key: &str) -> Option<Arc<MatchingRule>> {
        let key = key.trim();
        self.by_key
            .get(key)
            .or_else(|| self.by_key.get(&key.to_lowercase()))
            .cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<MatchingRule>> {
        self.rules.iter()
    }

    pub fn builtin() -> Self {
        use Capabilities as C;
        use Normalizer as N;
        const DIRECTORY_STRING: &str = "1.3.6.1.4.1.1466.115.121.1.15";
        const IA5: &str = "1.3.6.1.4.1.1466.115.121.1.26";
        const INTEGER: &str = "1.3.6.1.4.1.1466.115.121.1.27";
        const NUMERIC: &str = "1.3.6.1.4.1.1466.115.121.1.36";
        const SUBSTRING_ASSERTION: &str = "1.3.6.1.4.1.1466.115.121.1.58";
        const OCTET_STRING: &str = "1.3.6.1.4.1.1466.115.121.1.40";
        const GENERALIZED_TIME: &str = "1.3.6.1.4.1.1466.115.121.1.24";

        let mut r = Self::new();
        let rules = [
            ("2.5.13.0", "objectIdentifierMatch", "1.3.6.1.4.1.1466.115.121.1.38", N::Identity, C::EQUALITY),
            ("2.5.13.1", "distinguishedNameMatch", "1.3.6.1.4.1.1466.115.121.1.12", N::Identity, C::EQUALITY),
            ("2.5.13.2", "caseIgnoreMatch", DIRECTORY_STRING, N::CaseFold, C::EQUALITY),
            ("2.5.13.8", "numericStringMatch", NUMERIC, N::Integer, C::EQUALITY),
            ("2.5.13.11", "caseIgnoreListMatch", "1.3.6.1.4.1.1466.115.121.1.41", N::Identity, C::NONE),
            ("2.5.13.14", "integerMatch", INTEGER, N::Integer, C::EQUALITY),
            ("2.5.13.16", "bitStringMatch", "1.3.6.1.4.1.1466.115.121.1.6", N::Identity, C::NONE),
            ("2.5.13.20", "telephoneNumberMatch", "1.3.6.1.4.1.1466.115.121.1.50", N::Trim, C::EQUALITY),
            ("2.5.13.22", "presentationAddressMatch", "1.3.6.1.4.1.1466.115.121.1.43", N::Identity, C::NONE),
            ("2.5.13.23", "uniqueMemberMatch", "1.3.6.1.4.1.1466.115.121.1.34", N::Identity, C::NONE),
            ("2.5.13.24", "protocolInformationMatch", "1.3.6.1.4.1.1466.115.121.1.42", N::Identity, C::NONE),
            ("2.5.13.27", "generalizedTimeMatch", GENERALIZED_TIME, N::Identity, C::EQUALITY),
            ("2.5.13.29", "integerFirstComponentMatch", INTEGER, N::Integer, C::EQUALITY),
            ("2.5.13.30", "objectIdentifierFirstComponentMatch", "1.3.6.1.4.1.1466.115.121.1.38", N::Identity, C::EQUALITY),
            ("1.3.6.1.4.1.1466.109.114.1", "caseExactIA5Match", IA5, N::Trim, C::EQUALITY),
            ("1.3.6.1.4.1.1466.109.114.2", "caseIgnoreIA5Match", IA5, N::CaseFold, C::EQUALITY),
            ("2.5.13.28", "generalizedTimeOrderingMatch", GENERALIZED_TIME, N::Identity, C::ORDERING),
            ("2.5.13.3", "caseIgnoreOrderingMatch", DIRECTORY_STRING, N::CaseFold, C::ORDERING),
            ("2.5.13.4", "caseIgnoreSubstringsMatch", SUBSTRING_ASSERTION, N::CaseFold, C::SUBSTRINGS),
            ("2.5.13.21", "telephoneNumberSubstringsMatch", SUBSTRING_ASSERTION, N::Identity, C::SUBSTRINGS),
            ("2.5.13.10", "numericStringSubstringsMatch", SUBSTRING_ASSERTION, N::Identity, C::SUBSTRINGS),
            ("1.3.6.1.4.1.4203.1.2.1", "caseExactIA5SubstringsMatch", IA5, N::Trim, C::SUBSTRINGS),
            ("1.3.6.1.4.1.1466.109.114.3", "caseIgnoreIA5SubstringsMatch", IA5, N::CaseFold, C::SUBSTRINGS),
            ("2.5.13.5", "caseExactMatch", DIRECTORY_STRING, N::Identity, C::EQUALITY),
            ("2.5.13.6", "caseExactOrderingMatch", DIRECTORY_STRING, N::Identity, C::ORDERING),
            ("2.5.13.7", "caseExactSubstringsMatch", SUBSTRING_ASSERTION, N::Identity, C::SUBSTRINGS),
            ("2.5.13.9", "numericStringOrderingMatch", NUMERIC, N::Integer, C::ORDERING),
            ("2.5.13.13", "booleanMatch", "1.3.6.1.4.1.1466.115.121.1.7", N::Boolean, C::EQUALITY),
            ("2.5.13.15", "integerOrderingMatch", INTEGER, N::Integer, C::ORDERING),
            ("2.5.13.17", "octetStringMatch", OCTET_STRING, N::Identity, C::EQUALITY),
            ("2.5.13.18", "octetStringOrderingMatch", OCTET_STRING, N::Identity, C::ORDERING),
            ("2.5.13.19", "octetStringSubstringsMatch", OCTET_STRING, N::Identity, C::SUBSTRINGS),
        ];
        for (oid, name, syntax, normalizer, caps) in rules {
            r.add(MatchingRule::new(oid, name, syntax, normalizer, caps));
        }
        r
    }
}

/// The process-wide syntax and matching-rule catalogs, built once at startup
/// and handed to every schema that needs them.
#[derive(Debug, Clone)]
pub struct Registries {
    pub syntaxes: SyntaxRegistry,
    pub rules: MatchingRuleRegistry,
}

impl Registries {
    pub fn new(syntaxes: SyntaxRegistry, rules: MatchingRuleRegistry) -> Self {
        Self { syntaxes, rules }
    }

    pub fn builtin() -> Self {
        Self::new(SyntaxRegistry::builtin(), MatchingRuleRegistry::builtin())
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::builtin()
    }
}
