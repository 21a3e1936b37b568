//! LDAP schema: attribute types and object classes loaded from RFC 2252
//! descriptions (OpenLDAP schema file format), resolved into an arena, and
//! used to validate entries and modifications.

use crate::entry::{apply_values, Attributes, Modification, ModifyOperation};
use crate::matching::{MatchingRule, Registries};
use crate::result::{LdapError, LdapResult, ResultCode};
use crate::syntax::{split_oids, split_qdescrs, Syntax, ATTRIBUTE_TYPE_DESCRIPTION, OBJECT_CLASS_DESCRIPTION};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

pub const SUBSCHEMA_ENTRY_ATTR: &str = "cn";
pub const SUBSCHEMA_ENTRY_VALUE: &str = "Subschema";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Bad {kind} {text:?}")]
    Definition { kind: &'static str, text: String },
    #[error("Expected 'attributetype' or 'objectclass', got {0}")]
    StrayText(String),
    #[error("{oid}: unknown {kind} {target:?}")]
    Unresolved {
        oid: String,
        kind: &'static str,
        target: String,
    },
    #[error("duplicate OID {0}")]
    DuplicateOid(String),
    #[error("superior chain of {0} loops back on itself")]
    SuperiorCycle(String),
    #[error("cannot read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const KIND_ATTRIBUTE_TYPE: &str = "AttributeType";
const KIND_OBJECT_CLASS: &str = "ObjectClass";
const KIND_MATCHING_RULE: &str = "MatchingRule";

impl From<SchemaError> for LdapError {
    fn from(err: SchemaError) -> Self {
        let code = match &err {
            SchemaError::Unresolved { kind, .. } if *kind == KIND_ATTRIBUTE_TYPE => {
                ResultCode::UndefinedAttributeType
            }
            SchemaError::Unresolved { kind, .. } if *kind == KIND_MATCHING_RULE => {
                ResultCode::InappropriateMatching
            }
            SchemaError::Unresolved { .. } => ResultCode::ObjectClassViolation,
            SchemaError::Io { .. } => ResultCode::Other,
            _ => ResultCode::InvalidAttributeSyntax,
        };
        LdapError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeUsage {
    #[default]
    UserApplications,
    DirectoryOperation,
    DistributedOperation,
    DsaOperation,
}

impl AttributeUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeUsage::UserApplications => "userApplications",
            AttributeUsage::DirectoryOperation => "directoryOperation",
            AttributeUsage::DistributedOperation => "distributedOperation",
            AttributeUsage::DsaOperation => "dSAOperation",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "userApplications" => Some(AttributeUsage::UserApplications),
            "directoryOperation" => Some(AttributeUsage::DirectoryOperation),
            "distributedOperation" => Some(AttributeUsage::DistributedOperation),
            "dSAOperation" => Some(AttributeUsage::DsaOperation),
            _ => None,
        }
    }
}

/// Values after `resolve_oids`: references turned into objects and
/// properties inherited from the superior type.
#[derive(Debug, Clone, Default)]
struct Effective {
    sup: Option<usize>,
    equality: Option<Arc<MatchingRule>>,
    ordering: Option<Arc<MatchingRule>>,
    substr: Option<Arc<MatchingRule>>,
    syntax: Option<Arc<Syntax>>,
    max_len: Option<usize>,
    single_value: bool,
    collective: bool,
    no_user_modification: bool,
    usage: AttributeUsage,
}

/// An AttributeTypeDescription (RFC 2252 section 4.2). The public fields hold
/// the definition as written; accessors return the resolved values.
#[derive(Debug, Clone)]
pub struct AttributeType {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    pub sup: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    pub syntax: Option<String>,
    pub max_len: Option<usize>,
    pub single_value: bool,
    pub collective: bool,
    pub no_user_modification: bool,
    pub usage: Option<AttributeUsage>,
    effective: Effective,
}

fn opt(caps: &regex::Captures<'_>, i: usize) -> Option<String> {
    caps.get(i).map(|m| m.as_str().trim().to_string())
}

fn push_names(def: &mut String, names: &[String]) {
    match names {
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
}

impl AttributeType {
    pub fn from_def(text: &str) -> Result<Self, SchemaError> {
        let caps = ATTRIBUTE_TYPE_DESCRIPTION
            .captures(text)
            .ok_or_else(|| SchemaError::Definition {
                kind: "AttributeTypeDescription",
                text: text.trim().to_string(),
            })?;
        let max_len = caps.get(10).and_then(|m| m.as_str().parse::<usize>().ok());
        let single_value = caps.get(11).is_some();
        let collective = caps.get(12).is_some();
        let no_user_modification = caps.get(13).is_some();
        let usage = caps.get(14).and_then(|m| AttributeUsage::parse(m.as_str()));
        Ok(Self {
            oid: caps[1].to_string(),
            names: caps.get(2).map(|m| split_qdescrs(m.as_str())).unwrap_or_default(),
            desc: caps.get(3).map(|m| m.as_str().to_string()),
            obsolete: caps.get(4).is_some(),
            sup: opt(&caps, 5),
            equality: opt(&caps, 6),
            ordering: opt(&caps, 7),
            substr: opt(&caps, 8),
            syntax: opt(&caps, 9),
            max_len,
            single_value,
            collective,
            no_user_modification,
            usage,
            effective: Effective {
                max_len,
                single_value,
                collective,
                no_user_modification,
                usage: usage.unwrap_or_default(),
                ..Effective::default()
            },
        })
    }

    /// Canonical name: the first NAME, or the OID if there is none.
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.oid == name || self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn equality_rule(&self) -> Option<&Arc<MatchingRule>> {
        self.effective.equality.as_ref()
    }

    pub fn ordering_rule(&self) -> Option<&Arc<MatchingRule>> {
        self.effective.ordering.as_ref()
    }

    pub fn substr_rule(&self) -> Option<&Arc<MatchingRule>> {
        self.effective.substr.as_ref()
    }

    pub fn syntax_object(&self) -> Option<&Arc<Syntax>> {
        self.effective.syntax.as_ref()
    }

    pub fn effective_max_len(&self) -> Option<usize> {
        self.effective.max_len
    }

    pub fn is_single_value(&self) -> bool {
        self.effective.single_value
    }

    pub fn is_collective(&self) -> bool {
        self.effective.collective
    }

    pub fn is_no_user_modification(&self) -> bool {
        self.effective.no_user_modification
    }

    pub fn effective_usage(&self) -> AttributeUsage {
        self.effective.usage
    }

    /// Anything other than userApplications is operational (RFC 4512 section 3.4).
    pub fn is_operational(&self) -> bool {
        self.effective.usage != AttributeUsage::UserApplications
    }

    pub fn to_def(&self) -> String {
        let mut def = format!("( {} ", self.oid);
        push_names(&mut def, &self.names);
        if let Some(desc) = &self.desc {
            def.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            def.push_str("OBSOLETE ");
        }
        for (keyword, value) in [
            ("SUP", &self.sup),
            ("EQUALITY", &self.equality),
            ("ORDERING", &self.ordering),
            ("SUBSTR", &self.substr),
        ] {
            if let Some(v) = value {
                def.push_str(&format!("{} {} ", keyword, v));
            }
        }
        if let Some(syntax) = &self.syntax {
            match self.max_len {
                Some(len) => def.push_str(&format!("SYNTAX {}{{{}}} ", syntax, len)),
                None => def.push_str(&format!("SYNTAX {} ", syntax)),
            }
        }
        if self.single_value {
            def.push_str("SINGLE-VALUE ");
        }
        if self.collective {
            def.push_str("COLLECTIVE ");
        }
        if self.no_user_modification {
            def.push_str("NO-USER-MODIFICATION ");
        }
        if let Some(usage) = self.usage {
            def.push_str(&format!("USAGE {} ", usage.as_str()));
        }
        def.push(')');
        def
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

impl ObjectClassKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClassKind::Abstract => "ABSTRACT",
            ObjectClassKind::Structural => "STRUCTURAL",
            ObjectClassKind::Auxiliary => "AUXILIARY",
        }
    }
}

/// An ObjectClassDescription (RFC 2252 section 4.4).
#[derive(Debug, Clone)]
pub struct ObjectClass {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    pub sup: Vec<String>,
    pub kind: Option<ObjectClassKind>,
    pub must: Vec<String>,
    pub may: Vec<String>,
    resolved_sup: Vec<usize>,
    resolved_must: Vec<usize>,
    resolved_may: Vec<usize>,
}

impl ObjectClass {
    pub fn from_def(text: &str) -> Result<Self, SchemaError> {
        let caps = OBJECT_CLASS_DESCRIPTION
            .captures(text)
            .ok_or_else(|| SchemaError::Definition {
                kind: "ObjectClassDescription",
                text: text.trim().to_string(),
            })?;
        let list = |i: usize| caps.get(i).map(|m| split_oids(m.as_str())).unwrap_or_default();
        let kind = caps.get(6).map(|m| match m.as_str().trim() {
            "ABSTRACT" => ObjectClassKind::Abstract,
            "AUXILIARY" => ObjectClassKind::Auxiliary,
            _ => ObjectClassKind::Structural,
        });
        Ok(Self {
            oid: caps[1].to_string(),
            names: caps.get(2).map(|m| split_qdescrs(m.as_str())).unwrap_or_default(),
            desc: caps.get(3).map(|m| m.as_str().to_string()),
            obsolete: caps.get(4).is_some(),
            sup: list(5),
            kind,
            must: list(7),
            may: list(8),
            resolved_sup: Vec::new(),
            resolved_must: Vec::new(),
            resolved_may: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    /// Structural unless declared otherwise.
    pub fn effective_kind(&self) -> ObjectClassKind {
        self.kind.unwrap_or(ObjectClassKind::Structural)
    }

    pub fn to_def(&self) -> String {
        fn join(def: &mut String, keyword: &str, items: &[String]) {
            match items {
                [] => {}
                [one] => def.push_str(&format!("{} {} ", keyword, one)),
                many => def.push_str(&format!("{} ( {} ) ", keyword, many.join(" $ "))),
            }
        }
        let mut def = format!("( {} ", self.oid);
        push_names(&mut def, &self.names);
        if let Some(desc) = &self.desc {
            def.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            def.push_str("OBSOLETE ");
        }
        join(&mut def, "SUP", &self.sup);
        if let Some(kind) = self.kind {
            def.push_str(kind.as_str());
            def.push(' ');
        }
        join(&mut def, "MUST", &self.must);
        join(&mut def, "MAY", &self.may);
        def.push(')');
        def
    }
}

/// The base definitions every server needs: `top`, `objectClass`, the
/// operational attributes, and what is needed to publish the schema itself.
const SYSTEM_SCHEMA: &str = r#"
attributetype ( 1.3.6.1.4.1.250.1.57 NAME 'labeledURI' DESC 'RFC2079: Uniform Resource Identifier with optional label' EQUALITY caseExactMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )
attributetype ( 2.5.4.35 NAME 'userPassword' DESC 'RFC2256/2307: password of user' EQUALITY octetStringMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.40{128} )
attributetype ( 2.5.4.3 NAME ( 'cn' 'commonName' ) DESC 'RFC2256: common name(s) for which the entity is known by' SUP name )
attributetype ( 2.5.4.41 NAME 'name' DESC 'RFC2256: common supertype of name attributes' EQUALITY caseIgnoreMatch SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15{32768} )
attributetype ( 2.5.4.49 NAME 'distinguishedName' DESC 'RFC2256: common supertype of DN attributes' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 )
attributetype ( 2.16.840.1.113730.3.1.34 NAME 'ref' DESC 'namedref: subordinate referral URL' EQUALITY caseExactMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 USAGE distributedOperation )
attributetype ( 2.5.4.1 NAME ( 'aliasedObjectName' 'aliasedEntryName' ) DESC 'RFC2256: name of aliased object' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 SINGLE-VALUE )
attributetype ( 1.3.6.1.4.1.1466.101.120.16 NAME 'ldapSyntaxes' DESC 'RFC2252: LDAP syntaxes' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.54 USAGE directoryOperation )
attributetype ( 2.5.21.8 NAME 'matchingRuleUse' DESC 'RFC2252: matching rule uses' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.31 USAGE directoryOperation )
attributetype ( 2.5.21.6 NAME 'objectClasses' DESC 'RFC2252: object classes' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.37 USAGE directoryOperation )
attributetype ( 2.5.21.5 NAME 'attributeTypes' DESC 'RFC2252: attribute types' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.3 USAGE directoryOperation )
attributetype ( 2.5.21.4 NAME 'matchingRules' DESC 'RFC2252: matching rules' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.30 USAGE directoryOperation )
attributetype ( 1.3.6.1.1.5 NAME 'vendorVersion' DESC 'RFC3045: version of implementation' EQUALITY caseExactMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 SINGLE-VALUE NO-USER-MODIFICATION USAGE dSAOperation )
attributetype ( 1.3.6.1.1.4 NAME 'vendorName' DESC 'RFC3045: name of implementation vendor' EQUALITY caseExactMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 SINGLE-VALUE NO-USER-MODIFICATION USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.4203.1.3.5 NAME 'supportedFeatures' DESC 'features supported by the server' EQUALITY objectIdentifierMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.14 NAME 'supportedSASLMechanisms' DESC 'RFC2252: supported SASL mechanisms' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.15 NAME 'supportedLDAPVersion' DESC 'RFC2252: supported LDAP versions' SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.7 NAME 'supportedExtension' DESC 'RFC2252: supported extended operations' SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.13 NAME 'supportedControl' DESC 'RFC2252: supported controls' SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.5 NAME 'namingContexts' DESC 'RFC2252: naming contexts' SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 USAGE dSAOperation )
attributetype ( 1.3.6.1.4.1.1466.101.120.6 NAME 'altServer' DESC 'RFC2252: alternative servers' SYNTAX 1.3.6.1.4.1.1466.115.121.1.26 USAGE dSAOperation )
attributetype ( 2.5.18.10 NAME 'subschemaSubentry' DESC 'RFC2252: name of controlling subschema entry' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.18.9 NAME 'hasSubordinates' DESC 'X.501: entry has children' EQUALITY booleanMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.7 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.18.4 NAME 'modifiersName' DESC 'RFC2252: name of last modifier' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.18.3 NAME 'creatorsName' DESC 'RFC2252: name of creator' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.18.2 NAME 'modifyTimestamp' DESC 'RFC2252: time which object was last modified' EQUALITY generalizedTimeMatch ORDERING generalizedTimeOrderingMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.24 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.18.1 NAME 'createTimestamp' DESC 'RFC2252: time which object was created' EQUALITY generalizedTimeMatch ORDERING generalizedTimeOrderingMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.24 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.21.9 NAME 'structuralObjectClass' DESC 'X.500(93): structural object class of entry' EQUALITY objectIdentifierMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )
attributetype ( 2.5.4.0 NAME 'objectClass' DESC 'RFC2256: object classes of the entity' EQUALITY objectIdentifierMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 )
# not published by OpenLDAP, but referenced by the 'subschema' objectclass
attributetype ( 2.5.21.1 NAME 'dITStructureRules' EQUALITY integerFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.17 USAGE directoryOperation )
attributetype ( 2.5.21.7 NAME 'nameForms' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.35 USAGE directoryOperation )
attributetype ( 2.5.21.2 NAME 'dITContentRules' EQUALITY objectIdentifierFirstComponentMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.16 USAGE directoryOperation )

objectclass ( 2.5.20.1 NAME 'subschema' DESC 'RFC2252: controlling subschema (sub)entry' AUXILIARY MAY ( dITStructureRules $ nameForms $ ditContentRules $ objectClasses $ attributeTypes $ matchingRules $ matchingRuleUse ) )
objectClass ( 1.3.6.1.4.1.4203.1.4.1 NAME ( 'OpenLDAProotDSE' 'LDAProotDSE' ) DESC 'OpenLDAP Root DSE object' SUP top STRUCTURAL MAY cn )
objectClass ( 2.16.840.1.113730.3.2.6 NAME 'referral' DESC 'namedref: named subordinate referral' SUP top STRUCTURAL MUST ref )
objectClass ( 2.5.6.1 NAME 'alias' DESC 'RFC2256: an alias' SUP top STRUCTURAL MUST aliasedObjectName )
objectClass ( 1.3.6.1.4.1.1466.101.120.111 NAME 'extensibleObject' DESC 'RFC2252: extensible object' SUP top AUXILIARY )
objectClass ( 2.5.6.0 NAME 'top' DESC 'top of the superclass chain' ABSTRACT MUST objectClass )
"#;

enum Pending {
    None,
    AttributeType,
    ObjectClass,
}

/// One set of attribute types and object classes. Several schemas may share
/// the same `Registries`.
#[derive(Debug, Clone)]
pub struct Schema {
    registries: Arc<Registries>,
    attribute_types: Vec<AttributeType>,
    attr_index: HashMap<String, usize>,
    object_classes: Vec<ObjectClass>,
    oc_index: HashMap<String, usize>,
    resolved: bool,
    subschema: OnceLock<Attributes>,
}

fn lookup(index: &HashMap<String, usize>, key: &str) -> Option<usize> {
    let key = key.trim();
    index
        .get(key)
        .or_else(|| index.get(&key.to_lowercase()))
        .copied()
}

impl Schema {
    pub fn new(registries: Arc<Registries>) -> Self {
        Self {
            registries,
            attribute_types: Vec::new(),
            attr_index: HashMap::new(),
            object_classes: Vec::new(),
            oc_index: HashMap::new(),
            resolved: false,
            subschema: OnceLock::new(),
        }
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub fn subschema_dn(&self) -> String {
        format!("{}={}", SUBSCHEMA_ENTRY_ATTR, SUBSCHEMA_ENTRY_VALUE)
    }

    /// Drop the cached subschema subentry so the next request rebuilds it.
    pub fn changed(&mut self) {
        self.subschema = OnceLock::new();
    }

    pub fn add_attribute_type(&mut self, text: &str) -> Result<(), SchemaError> {
        let at = AttributeType::from_def(text)?;
        if self.attr_index.contains_key(&at.oid) {
            return Err(SchemaError::DuplicateOid(at.oid));
        }
        let idx = self.attribute_types.len();
        self.attr_index.insert(at.oid.clone(), idx);
        for n in &at.names {
            self.attr_index.insert(n.to_lowercase(), idx);
        }
        self.attribute_types.push(at);
        self.resolved = false;
        self.changed();
        Ok(())
    }

    pub fn add_object_class(&mut self, text: &str) -> Result<(), SchemaError> {
        let oc = ObjectClass::from_def(text)?;
        if self.oc_index.contains_key(&oc.oid) {
            return Err(SchemaError::DuplicateOid(oc.oid));
        }
        let idx = self.object_classes.len();
        self.oc_index.insert(oc.oid.clone(), idx);
        for n in &oc.names {
            self.oc_index.insert(n.to_lowercase(), idx);
        }
        self.object_classes.push(oc);
        self.resolved = false;
        self.changed();
        Ok(())
    }

    /// Look up an attribute type by OID or any of its names.
    pub fn attribute_type(&self, name: &str) -> Option<&AttributeType> {
        lookup(&self.attr_index, name).map(|i| &self.attribute_types[i])
    }

    pub fn find_attribute_type(&self, name: &str) -> LdapResult<&AttributeType> {
        self.attribute_type(name).ok_or_else(|| {
            LdapError::new(
                ResultCode::UndefinedAttributeType,
                format!("Unknown AttributeType {:?}", name),
            )
        })
    }

    pub fn object_class(&self, name: &str) -> Option<&ObjectClass> {
        lookup(&self.oc_index, name).map(|i| &self.object_classes[i])
    }

    pub fn find_object_class(&self, name: &str) -> LdapResult<&ObjectClass> {
        self.object_class(name).ok_or_else(|| {
            LdapError::object_class_violation(format!("Unknown ObjectClass {:?}", name))
        })
    }

    pub fn attribute_types(&self) -> &[AttributeType] {
        &self.attribute_types
    }

    pub fn object_classes(&self) -> &[ObjectClass] {
        &self.object_classes
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!("loading schema file {}", path.display());
        self.load(&text)
    }

    /// Load OpenLDAP-format schema text. Each definition starts on a line
    /// beginning `attributetype` or `objectclass`; indented lines continue
    /// it. Comments and blank lines are skipped. Elements must appear in
    /// RFC 2252 order.
    pub fn load(&mut self, text: &str) -> Result<(), SchemaError> {
        let mut pending = Pending::None;
        let mut data = String::new();
        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            let next = if lower.starts_with("objectclass") {
                Some((Pending::ObjectClass, &line["objectclass".len()..]))
            } else if lower.starts_with("attributetype") {
                Some((Pending::AttributeType, &line["attributetype".len()..]))
            } else {
                None
            };
            match next {
                Some((kind, rest)) => {
                    self.flush(&pending, &data)?;
                    pending = kind;
                    data = rest.to_string();
                }
                None => {
                    data.push(' ');
                    data.push_str(line);
                }
            }
        }
        self.flush(&pending, &data)
    }

    fn flush(&mut self, pending: &Pending, data: &str) -> Result<(), SchemaError> {
        match pending {
            Pending::AttributeType => self.add_attribute_type(data),
            Pending::ObjectClass => self.add_object_class(data),
            Pending::None if data.trim().is_empty() => Ok(()),
            Pending::None => Err(SchemaError::StrayText(data.trim().to_string())),
        }
    }

    /// Load the base definitions (`top`, `objectClass`, operational
    /// attributes, subschema publication).
    pub fn load_system(&mut self) -> Result<(), SchemaError> {
        self.load(SYSTEM_SCHEMA)
    }

    fn syntax_for(&self, oid: &str) -> Arc<Syntax> {
        self.registries.syntaxes.get(oid)
    }

    fn resolve_attribute(&mut self, idx: usize, state: &mut [u8]) -> Result<(), SchemaError> {
        match state[idx] {
            2 => return Ok(()),
            1 => return Err(SchemaError::SuperiorCycle(self.attribute_types[idx].oid.clone())),
            _ => {}
        }
        state[idx] = 1;
        let at = self.attribute_types[idx].clone();
        let sup = match &at.sup {
            Some(s) => Some(lookup(&self.attr_index, s).ok_or_else(|| SchemaError::Unresolved {
                oid: at.oid.clone(),
                kind: KIND_ATTRIBUTE_TYPE,
                target: s.clone(),
            })?),
            None => None,
        };
        let parent = match sup {
            Some(s) => {
                self.resolve_attribute(s, state)?;
                self.attribute_types[s].effective.clone()
            }
            None => Effective::default(),
        };
        let rules = &self.registries.rules;
        let rule = |local: &Option<String>, inherited: &Option<Arc<MatchingRule>>| match local {
            Some(name) => rules.find(name).map(Some).ok_or_else(|| SchemaError::Unresolved {
                oid: at.oid.clone(),
                kind: KIND_MATCHING_RULE,
                target: name.clone(),
            }),
            None => Ok(inherited.clone()),
        };
        let equality = rule(&at.equality, &parent.equality)?;
        let ordering = rule(&at.ordering, &parent.ordering)?;
        let substr = rule(&at.substr, &parent.substr)?;
        let syntax = match &at.syntax {
            Some(oid) => Some(self.syntax_for(oid)),
            None => parent.syntax.clone(),
        };
        self.attribute_types[idx].effective = Effective {
            sup,
            equality,
            ordering,
            substr,
            syntax,
            max_len: at.max_len.or(parent.max_len),
            single_value: at.single_value || parent.single_value,
            collective: at.collective || parent.collective,
            no_user_modification: at.no_user_modification || parent.no_user_modification,
            usage: at.usage.unwrap_or(parent.usage),
        };
        state[idx] = 2;
        Ok(())
    }

    /// Second pass: turn every textual reference into an arena index and
    /// inherit matching rules, syntax and flags from superior types. A
    /// matching rule missing from the registry is an error; unknown syntaxes
    /// become opaque.
    pub fn resolve_oids(&mut self) -> Result<(), SchemaError> {
        let mut state = vec![0u8; self.attribute_types.len()];
        for idx in 0..self.attribute_types.len() {
            self.resolve_attribute(idx, &mut state)?;
        }

        for idx in 0..self.object_classes.len() {
            let oc = &self.object_classes[idx];
            let resolve = |names: &[String], index: &HashMap<String, usize>, kind: &'static str| {
                names
                    .iter()
                    .map(|n| {
                        lookup(index, n).ok_or_else(|| SchemaError::Unresolved {
                            oid: oc.oid.clone(),
                            kind,
                            target: n.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            };
            let sup = resolve(&oc.sup, &self.oc_index, KIND_OBJECT_CLASS)?;
            let must = resolve(&oc.must, &self.attr_index, KIND_ATTRIBUTE_TYPE)?;
            let may = resolve(&oc.may, &self.attr_index, KIND_ATTRIBUTE_TYPE)?;
            let oc = &mut self.object_classes[idx];
            oc.resolved_sup = sup;
            oc.resolved_must = must;
            oc.resolved_may = may;
        }

        for idx in 0..self.object_classes.len() {
            let mut seen = HashSet::new();
            let mut stack = self.object_classes[idx].resolved_sup.clone();
            while let Some(s) = stack.pop() {
                if s == idx {
                    return Err(SchemaError::SuperiorCycle(self.object_classes[idx].oid.clone()));
                }
                if seen.insert(s) {
                    stack.extend(self.object_classes[s].resolved_sup.iter().copied());
                }
            }
        }

        self.resolved = true;
        self.changed();
        debug!(
            "schema resolved: {} attribute types, {} object classes",
            self.attribute_types.len(),
            self.object_classes.len()
        );
        Ok(())
    }

    /// `classes` plus all their superiors, without duplicates, in discovery order.
    fn with_superiors(&self, classes: Vec<usize>) -> Vec<usize> {
        let mut all = classes;
        let mut i = 0;
        while i < all.len() {
            for &s in &self.object_classes[all[i]].resolved_sup {
                if !all.contains(&s) {
                    all.push(s);
                }
            }
            i += 1;
        }
        all
    }

    fn attr_idx(&self, at: &AttributeType) -> Option<usize> {
        self.attr_index.get(&at.oid).copied()
    }

    /// Key in `entry` naming the same attribute type as `at`, under any alias.
    fn entry_key(&self, entry: &Attributes, at: &AttributeType) -> Option<String> {
        entry
            .keys()
            .find(|k| lookup(&self.attr_index, k) == self.attr_idx(at))
            .cloned()
    }

    /// Validate a new entry: every attribute is set as given.
    pub fn validate_entry(&self, attrs: &Attributes) -> LdapResult<Attributes> {
        let mods: Vec<Modification> = attrs
            .iter()
            .map(|(k, v)| Modification::new(ModifyOperation::Set, k.clone(), v.clone()))
            .collect();
        self.validate(&mods, &Attributes::new())
    }

    /// Apply `mods` to a copy of `entry` and check the result against the
    /// schema. Returns the updated entry, with attribute names in their
    /// canonical form for every attribute touched.
    pub fn validate(&self, mods: &[Modification], entry: &Attributes) -> LdapResult<Attributes> {
        self.validate_with(mods, entry, |_| true)
    }

    /// As `validate`, with `permit` deciding whether each modified attribute
    /// type may be changed at all.
    pub fn validate_with<F>(&self, mods: &[Modification], entry: &Attributes, permit: F) -> LdapResult<Attributes>
    where
        F: Fn(&AttributeType) -> bool,
    {
        let mut res = entry.clone();
        let mut oc_changed = false;

        for m in mods {
            let attr = self.find_attribute_type(&m.attr)?;
            let name = attr.name().to_string();
            if attr.is_no_user_modification() || !permit(attr) {
                return Err(LdapError::constraint_violation(format!("Cannot modify {}", name)));
            }

            let mut vals = match self.entry_key(&res, attr) {
                Some(key) => res.remove(&key).unwrap_or_default(),
                None => Vec::new(),
            };
            apply_values(&mut vals, m.op, &m.values);
            let checkvals: &[String] = match m.op {
                ModifyOperation::Delete => &[],
                _ => &m.values,
            };

            if attr.is_single_value() && vals.len() > 1 {
                return Err(LdapError::constraint_violation(format!(
                    "Attribute {} is SINGLE-VALUE",
                    name
                )));
            }
            if !vals.is_empty() {
                res.insert(name.clone(), vals);
            }

            for val in checkvals {
                if val.is_empty() {
                    return Err(LdapError::invalid_syntax(format!(
                        "Nil or empty value for attribute {}",
                        name
                    )));
                }
                if let Some(syntax) = attr.syntax_object() {
                    if !syntax.matches(val) {
                        return Err(LdapError::invalid_syntax(format!("Bad value for {}: {:?}", name, val)));
                    }
                }
                if let Some(max) = attr.effective_max_len() {
                    if val.chars().count() > max {
                        return Err(LdapError::constraint_violation(format!(
                            "Value too long for {} (max {})",
                            name, max
                        )));
                    }
                }
            }

            if attr.has_name("objectClass") {
                oc_changed = true;
            }
        }

        let oc_attr = self.find_attribute_type("objectClass")?;
        let oc_key = self.entry_key(&res, oc_attr);
        let oc_values = match oc_key.as_ref().and_then(|k| res.get(k)) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => return Err(LdapError::object_class_violation("objectClass attribute missing")),
        };
        let mut classes = Vec::with_capacity(oc_values.len());
        for v in &oc_values {
            let idx = lookup(&self.oc_index, v)
                .ok_or_else(|| LdapError::object_class_violation(format!("Unknown ObjectClass {:?}", v)))?;
            classes.push(idx);
        }
        let classes = self.with_superiors(classes);

        if oc_changed {
            if let Some(key) = &oc_key {
                res.remove(key);
            }
            res.insert(
                oc_attr.name().to_string(),
                classes.iter().map(|&i| self.object_classes[i].name().to_string()).collect(),
            );
            if !classes
                .iter()
                .any(|&i| self.object_classes[i].effective_kind() == ObjectClassKind::Structural)
            {
                return Err(LdapError::object_class_violation(
                    "Entry must have at least one structural objectClass",
                ));
            }
        }

        let mut allowed = HashSet::new();
        for &c in &classes {
            let oc = &self.object_classes[c];
            for &m in &oc.resolved_must {
                let at = &self.attribute_types[m];
                let present = self
                    .entry_key(&res, at)
                    .and_then(|k| res.get(&k))
                    .map(|v| !v.is_empty())
                    .unwrap_or(false);
                if !present {
                    return Err(LdapError::object_class_violation(format!(
                        "Missing attribute {} required by objectClass {}",
                        at.name(),
                        oc.name()
                    )));
                }
                allowed.insert(m);
            }
            allowed.extend(oc.resolved_may.iter().copied());
        }

        let extensible = classes
            .iter()
            .any(|&c| self.object_classes[c].names.iter().any(|n| n.eq_ignore_ascii_case("extensibleObject")));
        if !extensible {
            for key in res.keys() {
                let at = self.find_attribute_type(key)?;
                let permitted = self.attr_idx(at).map(|i| allowed.contains(&i)).unwrap_or(false);
                if !permitted && at.effective_usage() != AttributeUsage::DirectoryOperation {
                    return Err(LdapError::object_class_violation(format!(
                        "Attribute {} not permitted by objectClass",
                        key
                    )));
                }
            }
        }

        Ok(res)
    }

    /// The subschema subentry describing this schema (RFC 4512 section 4.2).
    /// Cached until the schema changes.
    pub fn subschema_subentry(&self) -> &Attributes {
        self.subschema.get_or_init(|| {
            let mut entry = Attributes::new();
            entry.insert(
                "objectClass".to_string(),
                vec!["top".into(), "subschema".into(), "extensibleObject".into()],
            );
            entry.insert(SUBSCHEMA_ENTRY_ATTR.to_string(), vec![SUBSCHEMA_ENTRY_VALUE.to_string()]);
            entry.insert(
                "objectClasses".to_string(),
                self.object_classes.iter().map(ObjectClass::to_def).collect(),
            );
            entry.insert(
                "attributeTypes".to_string(),
                self.attribute_types.iter().map(AttributeType::to_def).collect(),
            );
            entry.insert(
                "ldapSyntaxes".to_string(),
                self.registries.syntaxes.all().iter().map(|s| s.to_def()).collect(),
            );
            entry.insert(
                "matchingRules".to_string(),
                self.registries.rules.all().map(|r| r.to_def()).collect(),
            );
            entry
        })
    }

    /// Names of every definition of one kind: `objectClasses`,
    /// `attributeTypes`, `ldapSyntaxes` or `matchingRules`.
    pub fn names(&self, key: &str) -> Option<Vec<String>> {
        match key {
            "objectClasses" => Some(self.object_classes.iter().map(|o| o.name().to_string()).collect()),
            "attributeTypes" => Some(self.attribute_types.iter().map(|a| a.name().to_string()).collect()),
            "ldapSyntaxes" => Some(self.registries.syntaxes.all().iter().map(|s| s.oid.clone()).collect()),
            "matchingRules" => Some(self.registries.rules.all().map(|r| r.name().to_string()).collect()),
            _ => None,
        }
    }

    /// Resolved attribute names once `resolve_oids` has run, the names as
    /// written before that.
    fn class_attr_names(&self, raw: &[String], resolved: &[usize]) -> Vec<String> {
        if self.resolved {
            resolved.iter().map(|&i| self.attribute_types[i].name().to_string()).collect()
        } else {
            raw.to_vec()
        }
    }

    pub fn must(&self, oc: &str) -> Option<Vec<String>> {
        let o = self.object_class(oc)?;
        Some(self.class_attr_names(&o.must, &o.resolved_must))
    }

    pub fn may(&self, oc: &str) -> Option<Vec<String>> {
        let o = self.object_class(oc)?;
        Some(self.class_attr_names(&o.may, &o.resolved_may))
    }

    pub fn sup(&self, oc: &str) -> Option<Vec<String>> {
        let o = self.object_class(oc)?;
        Some(if self.resolved {
            o.resolved_sup
                .iter()
                .map(|&i| self.object_classes[i].name().to_string())
                .collect()
        } else {
            o.sup.clone()
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testdata::person_schema;
    use super::*;
    use std::io::Write;

    fn attrs(pairs: &[(&str, &[&str])]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn vals(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_attribute_type() {
        let def = "( 2.5.4.3 NAME 'cn' OBSOLETE EQUALITY 1.2.3 ORDERING 4.5.678 SUBSTR 9.1.1 SYNTAX 4.3.2{58} SINGLE-VALUE COLLECTIVE NO-USER-MODIFICATION USAGE userApplications )";
        let a = AttributeType::from_def(def).unwrap();
        assert_eq!(a.oid, "2.5.4.3");
        assert_eq!(a.name(), "cn");
        assert_eq!(a.names, vec!["cn"]);
        assert!(a.obsolete);
        assert_eq!(a.equality.as_deref(), Some("1.2.3"));
        assert_eq!(a.ordering.as_deref(), Some("4.5.678"));
        assert_eq!(a.substr.as_deref(), Some("9.1.1"));
        assert_eq!(a.syntax.as_deref(), Some("4.3.2"));
        assert_eq!(a.max_len, Some(58));
        assert!(a.single_value);
        assert!(a.collective);
        assert!(a.no_user_modification);
        assert_eq!(a.usage, Some(AttributeUsage::UserApplications));
        assert_eq!(a.to_def(), def);

        let def = "( 2.5.4.3 NAME ( 'cn' 'commonName' ) DESC 'RFC2256: common name(s) for which the entity is known by' SUP name )";
        let a = AttributeType::from_def(def).unwrap();
        assert_eq!(a.names, vec!["cn", "commonName"]);
        assert_eq!(a.desc.as_deref(), Some("RFC2256: common name(s) for which the entity is known by"));
        assert!(!a.obsolete);
        assert_eq!(a.sup.as_deref(), Some("name"));
        assert!(!a.single_value && !a.collective && !a.no_user_modification);
        assert_eq!(a.to_def(), def);
    }

    #[test]
    fn test_parse_object_class() {
        let def = "( 0.9.2342.19200300.100.4.19 NAME 'simpleSecurityObject' DESC 'RFC1274: simple security object' SUP top AUXILIARY MUST userPassword )";
        let o = ObjectClass::from_def(def).unwrap();
        assert_eq!(o.oid, "0.9.2342.19200300.100.4.19");
        assert_eq!(o.name(), "simpleSecurityObject");
        assert_eq!(o.desc.as_deref(), Some("RFC1274: simple security object"));
        assert_eq!(o.sup, vec!["top"]);
        assert_eq!(o.kind, Some(ObjectClassKind::Auxiliary));
        assert_eq!(o.must, vec!["userPassword"]);
        assert!(o.may.is_empty());
        assert_eq!(o.to_def(), def);

        let def = "( 2.5.6.6 NAME 'person' DESC 'RFC2256: a person' SUP top STRUCTURAL MUST ( sn $ cn ) MAY ( userPassword $ telephoneNumber $ seeAlso $ description ) )";
        let o = ObjectClass::from_def(def).unwrap();
        assert_eq!(o.effective_kind(), ObjectClassKind::Structural);
        assert_eq!(o.must, vec!["sn", "cn"]);
        assert_eq!(o.may, vec!["userPassword", "telephoneNumber", "seeAlso", "description"]);
        assert_eq!(o.to_def(), def);
    }

    #[test]
    fn test_bad_definition() {
        assert!(matches!(
            AttributeType::from_def("( cn NAME 'cn' )"),
            Err(SchemaError::Definition { .. })
        ));
        // MAY before SUP is out of RFC 2252 order
        assert!(ObjectClass::from_def("( 1.2.3 NAME 'x' MAY cn SUP top )").is_err());
    }

    #[test]
    fn test_backwards_api() {
        let mut s = Schema::new(Arc::new(Registries::builtin()));
        s.load_system().unwrap();
        let mut names = s.names("objectClasses").unwrap();
        names.sort();
        let mut expected = vec!["subschema", "OpenLDAProotDSE", "referral", "alias", "extensibleObject", "top"];
        expected.sort();
        assert_eq!(names, expected);
        assert_eq!(
            s.may("subschema").unwrap(),
            vec!["dITStructureRules", "nameForms", "ditContentRules", "objectClasses", "attributeTypes", "matchingRules", "matchingRuleUse"]
        );
        assert_eq!(s.must("subschema").unwrap(), Vec::<String>::new());
        assert_eq!(s.must("foo"), None);
        assert_eq!(s.sup("extensibleObject").unwrap(), vec!["top"]);
        assert_eq!(s.names("nonsense"), None);
    }

    #[test]
    fn test_resolve_inherits_from_superior() {
        let s = person_schema();
        let a = s.find_attribute_type("objectclass").unwrap();
        assert_eq!(a.name(), "objectClass");
        let a = s.find_attribute_type("COMMONNAME").unwrap();
        assert_eq!(a.name(), "cn");
        assert_eq!(a.equality_rule().unwrap().name(), "caseIgnoreMatch");
        assert_eq!(a.substr_rule().unwrap().name(), "caseIgnoreSubstringsMatch");
        assert_eq!(a.syntax_object().unwrap().oid, "1.3.6.1.4.1.1466.115.121.1.15");
        assert_eq!(a.effective_max_len(), Some(32768));
        // definition text is untouched by inheritance
        assert_eq!(a.equality, None);

        let c = s.find_attribute_type("COUNTRYname").unwrap();
        assert_eq!(c.name(), "c");
        assert!(c.syntax_object().unwrap().matches("GB"));
        assert!(!c.syntax_object().unwrap().matches("ABC"));

        let l = s.find_attribute_type("ldapSyntaxes").unwrap();
        assert_eq!(l.equality_rule().unwrap().name(), "objectIdentifierFirstComponentMatch");

        // unknown syntaxes are registered as opaque and shared
        let d = s.find_attribute_type("dITStructureRules").unwrap();
        let opaque = d.syntax_object().unwrap();
        assert_eq!(opaque.oid, "1.3.6.1.4.1.1466.115.121.1.17");
        assert!(Arc::ptr_eq(opaque, &s.registries.syntaxes.get("1.3.6.1.4.1.1466.115.121.1.17")));

        assert_eq!(s.may("subschema").unwrap()[2], "dITContentRules");
        assert_eq!(
            s.find_attribute_type("nope").unwrap_err().code,
            ResultCode::UndefinedAttributeType
        );
        assert_eq!(s.find_object_class("nope").unwrap_err().code, ResultCode::ObjectClassViolation);
    }

    #[test]
    fn test_resolve_errors() {
        let reg = Arc::new(Registries::builtin());
        let mut s = Schema::new(reg.clone());
        s.load("objectclass ( 1.2.3 NAME 'x' SUP top MUST nothere )").unwrap();
        s.load("objectclass ( 1.2.4 NAME 'top' ABSTRACT )").unwrap();
        let err = s.resolve_oids().unwrap_err();
        assert!(matches!(err, SchemaError::Unresolved { ref target, .. } if target == "nothere"));
        assert_eq!(LdapError::from(err).code, ResultCode::UndefinedAttributeType);

        let mut s = Schema::new(reg.clone());
        s.load("attributetype ( 1.2.3 NAME 'a' SUP b )\nattributetype ( 1.2.4 NAME 'b' SUP a )")
            .unwrap();
        assert!(matches!(s.resolve_oids(), Err(SchemaError::SuperiorCycle(_))));

        let mut s = Schema::new(reg.clone());
        s.load("attributetype ( 1.2.3 NAME 'a' )").unwrap();
        assert!(matches!(
            s.load("attributetype ( 1.2.3 NAME 'b' )"),
            Err(SchemaError::DuplicateOid(_))
        ));

        let mut s = Schema::new(reg.clone());
        s.load(
            "attributetype ( 1.2.3.4 NAME 'foo' EQUALITY noSuchMatch SUBSTR bogusSubstringsMatch \
             SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
        )
        .unwrap();
        let err = s.resolve_oids().unwrap_err();
        assert!(matches!(
            err,
            SchemaError::Unresolved { ref oid, kind, ref target }
                if oid == "1.2.3.4" && kind == KIND_MATCHING_RULE && target == "noSuchMatch"
        ));
        assert_eq!(LdapError::from(err).code, ResultCode::InappropriateMatching);

        // an inherited rule is not looked up again
        let mut s = Schema::new(reg.clone());
        s.load_system().unwrap();
        s.load("attributetype ( 1.2.3.5 NAME 'nick' SUP name )").unwrap();
        s.resolve_oids().unwrap();
        assert_eq!(s.attribute_type("nick").unwrap().equality_rule().unwrap().name(), "caseIgnoreMatch");

        let mut s = Schema::new(reg);
        let err = s.load("this is not schema\n").unwrap_err();
        assert!(matches!(err, SchemaError::StrayText(_)));
        assert_eq!(LdapError::from(err).code, ResultCode::InvalidAttributeSyntax);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# test").unwrap();
        writeln!(file, "attributetype ( 1.2.3.4 NAME 'fooAttr'").unwrap();
        writeln!(file, "    SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )").unwrap();
        let mut s = Schema::new(Arc::new(Registries::builtin()));
        s.load_file(file.path()).unwrap();
        s.resolve_oids().unwrap();
        assert!(s.attribute_type("fooattr").is_some());

        let err = s.load_file("/nonexistent/schema/file").unwrap_err();
        assert!(matches!(err, SchemaError::Io { .. }));
    }

    #[test]
    fn test_validate_new_entry() {
        let s = person_schema();
        let entry = attrs(&[("objectclass", &["organizationalPerson"]), ("commonName", &["Fred"]), ("sn", &["Bloggs"])]);
        let res = s.validate_entry(&entry).unwrap();
        assert_eq!(res["objectClass"], vals(&["organizationalPerson", "person", "top"]));
        assert_eq!(res["cn"], vals(&["Fred"]));
        assert!(!res.contains_key("commonName"));
    }

    #[test]
    fn test_validate_missing_must() {
        let s = person_schema();
        let err = s
            .validate_entry(&attrs(&[("objectClass", &["person"]), ("cn", &["Fred"])]))
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ObjectClassViolation);
        assert!(err.message.contains("sn"));
    }

    #[test]
    fn test_validate_not_permitted_and_extensible() {
        let s = person_schema();
        let entry = attrs(&[("objectClass", &["person"]), ("cn", &["Fred"]), ("sn", &["B"]), ("mail", &["f@x"])]);
        assert_eq!(s.validate_entry(&entry).unwrap_err().code, ResultCode::ObjectClassViolation);

        let entry = attrs(&[
            ("objectClass", &["person", "extensibleObject"]),
            ("cn", &["Fred"]),
            ("sn", &["B"]),
            ("mail", &["f@x"]),
        ]);
        assert!(s.validate_entry(&entry).is_ok());

        // operational directory attributes are always allowed
        let mut existing = s
            .validate_entry(&attrs(&[("objectClass", &["person"]), ("cn", &["F"]), ("sn", &["B"])]))
            .unwrap();
        existing.insert("createTimestamp".into(), vals(&["20240101000000Z"]));
        assert!(s.validate(&[], &existing).is_ok());
    }

    #[test]
    fn test_validate_structural_required() {
        let s = person_schema();
        let err = s.validate_entry(&attrs(&[("objectClass", &["dcObject"]), ("dc", &["x"])])).unwrap_err();
        assert_eq!(err.code, ResultCode::ObjectClassViolation);
        assert!(err.message.contains("structural"));
    }

    #[test]
    fn test_validate_value_checks() {
        let s = person_schema();
        let base = s
            .validate_entry(&attrs(&[("objectClass", &["organizationalPerson"]), ("cn", &["F"]), ("sn", &["B"])]))
            .unwrap();

        let err = s.validate(&[Modification::add("c", vals(&["GB", "FR"]))], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::ConstraintViolation);

        let err = s.validate(&[Modification::replace("c", vals(&["GBR"]))], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::InvalidAttributeSyntax);

        let err = s.validate(&[Modification::replace("uidNumber", vals(&["abc"]))], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::InvalidAttributeSyntax);

        let err = s.validate(&[Modification::add("description", vals(&[""]))], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::InvalidAttributeSyntax);

        let err = s
            .validate(&[Modification::add("telephoneNumber", vals(&[&"1".repeat(33)]))], &base)
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ConstraintViolation);

        let err = s.validate(&[Modification::add("nosuchattr", vals(&["x"]))], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::UndefinedAttributeType);

        let err = s
            .validate(&[Modification::replace("createTimestamp", vals(&["20240101000000Z"]))], &base)
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ConstraintViolation);
    }

    #[test]
    fn test_validate_modifications() {
        let s = person_schema();
        let base = s
            .validate_entry(&attrs(&[("objectClass", &["organizationalPerson"]), ("cn", &["F"]), ("sn", &["B"])]))
            .unwrap();
        let res = s
            .validate(
                &[
                    Modification::add("mail", vals(&["a@x", "b@x"])),
                    Modification::delete("mail", vals(&["a@x"])),
                    Modification::replace("uidNumber", vals(&["42"])),
                ],
                &base,
            )
            .unwrap();
        assert_eq!(res["mail"], vals(&["b@x"]));
        assert_eq!(res["uidNumber"], vals(&["42"]));

        let res = s.validate(&[Modification::delete("mail", vec![])], &res).unwrap();
        assert!(!res.contains_key("mail"));

        let err = s.validate(&[Modification::delete("sn", vec![])], &base).unwrap_err();
        assert_eq!(err.code, ResultCode::ObjectClassViolation);

        let err = s.validate(&[Modification::delete("objectClass", vec![])], &base).unwrap_err();
        assert_eq!(err.message, "objectClass attribute missing");
    }

    #[test]
    fn test_validate_idempotent() {
        let s = person_schema();
        let base = s
            .validate_entry(&attrs(&[("objectClass", &["person"]), ("cn", &["F"]), ("sn", &["B"])]))
            .unwrap();
        assert_eq!(s.validate(&[], &base).unwrap(), base);
    }

    #[test]
    fn test_validate_with_permit() {
        let s = person_schema();
        let base = s
            .validate_entry(&attrs(&[("objectClass", &["person"]), ("cn", &["F"]), ("sn", &["B"])]))
            .unwrap();
        let mods = [Modification::replace("description", vals(&["hello"]))];
        let err = s
            .validate_with(&mods, &base, |at| at.name() != "description")
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ConstraintViolation);
        assert!(s.validate_with(&mods, &base, |_| true).is_ok());
    }

    #[test]
    fn test_subschema_subentry() {
        let mut s = person_schema();
        assert_eq!(s.subschema_dn(), "cn=Subschema");
        let entry = s.subschema_subentry().clone();
        assert_eq!(entry["objectClass"], vals(&["top", "subschema", "extensibleObject"]));
        assert_eq!(entry["cn"], vals(&["Subschema"]));
        assert_eq!(entry["objectClasses"].len(), s.object_classes().len());
        assert_eq!(entry["attributeTypes"].len(), s.attribute_types().len());
        assert!(entry["matchingRules"]
            .contains(&"( 2.5.13.2 NAME 'caseIgnoreMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )".to_string()));
        assert!(entry["ldapSyntaxes"].contains(&"( 1.3.6.1.4.1.1466.115.121.1.17 )".to_string()));
        assert!(s.names("ldapSyntaxes").unwrap().contains(&"1.3.6.1.4.1.1466.115.121.1.17".to_string()));

        s.load("attributetype ( 1.9.9 NAME 'late' SUP name )").unwrap();
        s.resolve_oids().unwrap();
        assert_eq!(s.subschema_subentry()["attributeTypes"].len(), entry["attributeTypes"].len() + 1);
    }
}
