//! LDAP attribute syntaxes (RFC 2252 section 6) and the description grammars
//! used to parse schema text.

use crate::result::{LdapError, LdapResult};
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const KEYSTR: &str = r"[a-zA-Z][a-zA-Z0-9;-]*";
const NUMERICOID: &str = r"( \d[\d.]+\d )";
const QDSTRING: &str = r"\s* ' (.*?) ' \s*";
const NOIDLEN: &str = r"(\d[\d.]+\d) (?: \{ (\d+) \} )?";
const ATTRIBUTE_USAGE: &str = r"(userApplications|directoryOperation|distributedOperation|dSAOperation)";

fn woid() -> String {
    format!(r"\s* ( {k} | \d[\d.]+\d ) \s*", k = KEYSTR)
}

fn oids() -> String {
    let bare = format!(r"\s* (?: {k} | \d[\d.]+\d ) \s*", k = KEYSTR);
    format!(r"( {w} | \s* \( {w} (?: \$ {w} )* \) \s* )", w = bare)
}

fn qdescrs() -> String {
    let one = format!(r"\s* ' {k} ' \s*", k = KEYSTR);
    format!(r"( {q} | \s* \( (?:{q})+ \) \s* )", q = one)
}

fn build(pattern: String) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(&format!("(?x){}", pattern)).expect("Invalid schema grammar regex")
}

lazy_static! {
    /// Groups: 1 oid, 2 names, 3 desc, 4 obsolete, 5 sup, 6 equality,
    /// 7 ordering, 8 substr, 9 syntax, 10 max length, 11 single-value,
    /// 12 collective, 13 no-user-modification, 14 usage.
    pub static ref ATTRIBUTE_TYPE_DESCRIPTION: Regex = build(format!(
        r"\A \s* \( \s* {oid} \s*
          (?: NAME {qd} )?
          (?: DESC {qs} )?
          ( OBSOLETE \s* )?
          (?: SUP {w} )?
          (?: EQUALITY {w} )?
          (?: ORDERING {w} )?
          (?: SUBSTR {w} )?
          (?: SYNTAX \s* {nl} \s* )?
          ( SINGLE-VALUE \s* )?
          ( COLLECTIVE \s* )?
          ( NO-USER-MODIFICATION \s* )?
          (?: USAGE \s* {usage} )?
          \s* \) \s* \z",
        oid = NUMERICOID, qd = qdescrs(), qs = QDSTRING, w = woid(), nl = NOIDLEN, usage = ATTRIBUTE_USAGE
    ));

    /// Groups: 1 oid, 2 names, 3 desc, 4 obsolete, 5 sup, 6 kind, 7 must, 8 may.
    pub static ref OBJECT_CLASS_DESCRIPTION: Regex = build(format!(
        r"\A \s* \( \s* {oid} \s*
          (?: NAME {qd} )?
          (?: DESC {qs} )?
          ( OBSOLETE \s* )?
          (?: SUP {o} )?
          (?: ( ABSTRACT|STRUCTURAL|AUXILIARY ) \s* )?
          (?: MUST {o} )?
          (?: MAY {o} )?
          \s* \) \s* \z",
        oid = NUMERICOID, qd = qdescrs(), qs = QDSTRING, o = oids()
    ));

    /// Groups: 1 oid, 2 names, 3 desc, 4 obsolete, 5 syntax.
    pub static ref MATCHING_RULE_DESCRIPTION: Regex = build(format!(
        r"\A \s* \( \s* {oid} \s*
          (?: NAME {qd} )?
          (?: DESC {qs} )?
          ( OBSOLETE \s* )?
          SYNTAX \s* {oid} \s*
          \s* \) \s* \z",
        oid = NUMERICOID, qd = qdescrs(), qs = QDSTRING
    ));

    /// Groups: 1 oid, 2 names, 3 desc, 4 obsolete, 5 applies.
    pub static ref MATCHING_RULE_USE_DESCRIPTION: Regex = build(format!(
        r"\A \s* \( \s* {oid} \s*
          (?: NAME {qd} )?
          (?: DESC {qs} )?
          ( OBSOLETE \s* )?
          APPLIES \s* {o} \s*
          \s* \) \s* \z",
        oid = NUMERICOID, qd = qdescrs(), qs = QDSTRING, o = oids()
    ));

    /// Groups: 1 oid, 2 desc, 3 binary transfer required, 4 not human readable.
    pub static ref LDAP_SYNTAX_DESCRIPTION: Regex = build(format!(
        r"\A \s* \( \s* {oid} \s*
          (?: DESC {qs} )?
          (?: X-BINARY-TRANSFER-REQUIRED \s* ' (TRUE|FALSE) ' \s* )?
          (?: X-NOT-HUMAN-READABLE \s* ' (TRUE|FALSE) ' \s* )?
          \s* \) \s* \z",
        oid = NUMERICOID, qs = QDSTRING
    ));

    static ref OID_VALUE: Regex = build(format!(r"\A {} \z", woid()));
    static ref QUOTED: Regex = build(r"' (.*?) '".to_string());
    static ref BIT_STRING: Regex = build(r"\A '[01]*'B \z".to_string());
    static ref BOOLEAN: Regex = build(r"\A (TRUE|FALSE) \z".to_string());
    static ref COUNTRY: Regex = build(r"(?i) \A [A-Z]{2} \z".to_string());
    static ref INTEGER: Regex = build(r"\A -?\d+ \z".to_string());
    static ref NUMERIC_STRING: Regex = build(r"\A \d+ \z".to_string());
}

/// Names out of a QDESCRS capture: `'a'` or `( 'a' 'b' )`.
pub(crate) fn split_qdescrs(text: &str) -> Vec<String> {
    QUOTED
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// OIDs/names out of an OIDS capture: `top` or `( sn $ cn )`.
pub(crate) fn split_oids(text: &str) -> Vec<String> {
    text.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split('$')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Syntax {
    pub oid: String,
    pub desc: Option<String>,
    /// Not human-readable.
    pub nhr: bool,
    /// Binary transfer required.
    pub binary: bool,
    pattern: Option<Regex>,
}

impl Syntax {
    pub fn new(oid: impl Into<String>, desc: Option<&str>) -> Self {
        Self {
            oid: oid.into(),
            desc: desc.map(str::to_string),
            nhr: false,
            binary: false,
            pattern: None,
        }
    }

    /// A syntax that accepts any value.
    pub fn opaque(oid: impl Into<String>) -> Self {
        Self::new(oid, None)
    }

    fn with_pattern(mut self, re: &Regex) -> Self {
        self.pattern = Some(re.clone());
        self
    }

    fn not_human_readable(mut self) -> Self {
        self.nhr = true;
        self
    }

    fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    /// Parse an LDAPSyntaxDescription.
    pub fn from_def(text: &str) -> LdapResult<Self> {
        let caps = LDAP_SYNTAX_DESCRIPTION.captures(text).ok_or_else(|| {
            LdapError::invalid_syntax(format!("Bad SyntaxTypeDescription {:?}", text))
        })?;
        let flag = |i: usize| caps.get(i).map(|m| m.as_str() == "TRUE").unwrap_or(false);
        let mut syntax = Syntax::new(&caps[1], caps.get(2).map(|m| m.as_str()));
        syntax.binary = flag(3);
        syntax.nhr = flag(4);
        Ok(syntax)
    }

    pub fn to_def(&self) -> String {
        let mut def = format!("( {} ", self.oid);
        if let Some(desc) = &self.desc {
            def.push_str(&format!("DESC '{}' ", desc));
        }
        if self.binary {
            def.push_str("X-BINARY-TRANSFER-REQUIRED 'TRUE' ");
        }
        if self.nhr {
            def.push_str("X-NOT-HUMAN-READABLE 'TRUE' ");
        }
        def.push(')');
        def
    }

    /// Whether `value` is acceptable for this syntax. Syntaxes without a
    /// validator accept everything.
    pub fn matches(&self, value: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(value),
            None => true,
        }
    }
}

impl PartialEq for Syntax {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
            && self.desc == other.desc
            && self.nhr == other.nhr
            && self.binary == other.binary
    }
}

/// Syntaxes keyed by OID. The known set is built once; OIDs nobody
/// registered are added on first lookup as opaque syntaxes.
#[derive(Debug, Clone, Default)]
pub struct SyntaxRegistry {
    syntaxes: HashMap<String, Arc<Syntax>>,
    order: Vec<String>,
    opaque: DashMap<String, Arc<Syntax>>,
}

impl SyntaxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, syntax: Syntax) -> Arc<Syntax> {
        let syntax = Arc::new(syntax);
        self.opaque.remove(&syntax.oid);
        if self
            .syntaxes
            .insert(syntax.oid.clone(), syntax.clone())
            .is_none()
        {
            self.order.push(syntax.oid.clone());
        }
        syntax
    }

    /// The syntax for `oid`, registering an opaque one if it is unknown.
    /// Later lookups of the same OID return the same entry.
    pub fn get(&self, oid: &str) -> Arc<Syntax> {
        let oid = oid.trim();
        if let Some(s) = self.syntaxes.get(oid) {
            return s.clone();
        }
        self.opaque
            .entry(oid.to_string())
            .or_insert_with(|| {
                debug!("Registering opaque syntax {}", oid);
                Arc::new(Syntax::opaque(oid))
            })
            .clone()
    }

    /// Lookup without registering.
    pub fn find(&self, oid: &str) -> Option<Arc<Syntax>> {
        let oid = oid.trim();
        self.syntaxes
            .get(oid)
            .cloned()
            .or_else(|| self.opaque.get(oid).map(|s| s.clone()))
    }

    pub fn len(&self) -> usize {
        self.order.len() + self.opaque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty() && self.opaque.is_empty()
    }

    /// Registered syntaxes in registration order, then opaque ones by OID.
    pub fn all(&self) -> Vec<Arc<Syntax>> {
        let mut all: Vec<Arc<Syntax>> = self
            .order
            .iter()
            .filter_map(|oid| self.syntaxes.get(oid).cloned())
            .collect();
        let mut opaque: Vec<Arc<Syntax>> = self.opaque.iter().map(|e| e.value().clone()).collect();
        opaque.sort_by(|a, b| a.oid.cmp(&b.oid));
        all.extend(opaque);
        all
    }

    /// The RFC 2252 syntaxes an LDAPv3 server should support.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        let s = |oid: &str, desc: &str| Syntax::new(format!("1.3.6.1.4.1.1466.115.121.1.{}", oid), Some(desc));
        r.add(s("3", "Attribute Type Description").with_pattern(&ATTRIBUTE_TYPE_DESCRIPTION));
        r.add(s("5", "Binary").not_human_readable());
        r.add(s("6", "Bit String").with_pattern(&BIT_STRING));
        r.add(s("7", "Boolean").with_pattern(&BOOLEAN));
        r.add(s("8", "Certificate").binary().not_human_readable());
        r.add(s("9", "Certificate List").binary().not_human_readable());
        r.add(s("10", "Certificate Pair").binary().not_human_readable());
        r.add(s("11", "Country String").with_pattern(&COUNTRY));
        r.add(s("12", "Distinguished Name"));
        r.add(s("15", "Directory String"));
        r.add(s("22", "Facsimile Telephone Number"));
        r.add(s("23", "Fax").not_human_readable());
        r.add(s("24", "Generalized Time"));
        r.add(s("26", "IA5 String"));
        r.add(s("27", "Integer").with_pattern(&INTEGER));
        r.add(s("28", "JPEG").not_human_readable());
        r.add(s("30", "Matching Rule Description").with_pattern(&MATCHING_RULE_DESCRIPTION));
        r.add(s("31", "Matching Rule Use Description").with_pattern(&MATCHING_RULE_USE_DESCRIPTION));
        r.add(s("33", "MHS OR Address"));
        r.add(s("34", "Name And Optional UID"));
        r.add(s("36", "Numeric String").with_pattern(&NUMERIC_STRING));
        r.add(s("37", "Object Class Description").with_pattern(&OBJECT_CLASS_DESCRIPTION));
        r.add(s("38", "OID").with_pattern(&OID_VALUE));
        r.add(s("39", "Other Mailbox"));
        r.add(s("41", "Postal Address"));
        r.add(s("43", "Presentation Address"));
        r.add(s("44", "Printable String"));
        r.add(s("50", "Telephone Number"));
        r.add(s("53", "UTC Time"));
        r.add(s("54", "LDAP Syntax Description").with_pattern(&LDAP_SYNTAX_DESCRIPTION));
        r.add(s("4", "Audio").not_human_readable());
        r.add(s("40", "Octet String"));
        r.add(s("58", "Substring Assertion"));
        r
    }
}
