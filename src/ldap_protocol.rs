// LDAPv3 message layer (RFC 4511): envelope decoding, request decoders and
// response encoders on top of the BER element tree.

use crate::ber::{BerElement, BerError, BerWriter, TagClass, TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE, TAG_SET};
use crate::entry::{Attributes, Modification, ModifyOperation};
use crate::result::{LdapError, LdapResult as Result, ResultCode};

pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF Control
const LDAP_CONTEXT_CONTROLS: u32 = 0;

/// OID for the StartTLS extended operation (RFC 4511 section 4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// responseName of the unsolicited Notice of Disconnection (RFC 4511 section 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

// LDAP Control (request side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// A decoded envelope. Operations with a body keep it as an element tree; the
/// operation decodes its own fields so that a malformed body fails that
/// request only.
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BerElement),
    UnbindRequest,
    SearchRequest(BerElement),
    ModifyRequest(BerElement),
    AddRequest(BerElement),
    DelRequest(BerElement),
    ModifyDNRequest(BerElement),
    CompareRequest(BerElement),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    /// Any other application tag, including responses sent by a confused client.
    Unrecognized(u32),
}

/// What kind of request an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Bind,
    Unbind,
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Abandon,
    Extended,
    Unknown,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Bind => "bind",
            OpKind::Unbind => "unbind",
            OpKind::Search => "search",
            OpKind::Modify => "modify",
            OpKind::Add => "add",
            OpKind::Delete => "delete",
            OpKind::ModifyDn => "modifydn",
            OpKind::Compare => "compare",
            OpKind::Abandon => "abandon",
            OpKind::Extended => "extended",
            OpKind::Unknown => "unknown",
        }
    }
}

impl ProtocolOp {
    pub fn kind(&self) -> OpKind {
        match self {
            ProtocolOp::BindRequest(_) => OpKind::Bind,
            ProtocolOp::UnbindRequest => OpKind::Unbind,
            ProtocolOp::SearchRequest(_) => OpKind::Search,
            ProtocolOp::ModifyRequest(_) => OpKind::Modify,
            ProtocolOp::AddRequest(_) => OpKind::Add,
            ProtocolOp::DelRequest(_) => OpKind::Delete,
            ProtocolOp::ModifyDNRequest(_) => OpKind::ModifyDn,
            ProtocolOp::CompareRequest(_) => OpKind::Compare,
            ProtocolOp::AbandonRequest(_) => OpKind::Abandon,
            ProtocolOp::ExtendedRequest(_) => OpKind::Extended,
            ProtocolOp::Unrecognized(_) => OpKind::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

fn protocol_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(LdapError::protocol(msg))
}

fn universal<'a>(el: &'a BerElement, tag: u32, what: &str) -> std::result::Result<&'a BerElement, BerError> {
    el.expect(TagClass::Universal, tag, what)
}

fn field<'a>(parts: &'a [BerElement], idx: usize, what: &str) -> Result<&'a BerElement> {
    parts
        .get(idx)
        .ok_or_else(|| LdapError::protocol(format!("missing {}", what)))
}

fn string_at(parts: &[BerElement], idx: usize, what: &str) -> Result<String> {
    Ok(universal(field(parts, idx, what)?, TAG_OCTET_STRING, what)?.as_string()?)
}

fn int_at(parts: &[BerElement], idx: usize, what: &str) -> Result<i64> {
    Ok(universal(field(parts, idx, what)?, TAG_INTEGER, what)?.as_integer()?)
}

fn enum_at(parts: &[BerElement], idx: usize, what: &str) -> Result<i64> {
    Ok(universal(field(parts, idx, what)?, TAG_ENUMERATED, what)?.as_integer()?)
}

fn bool_at(parts: &[BerElement], idx: usize, what: &str) -> Result<bool> {
    Ok(universal(field(parts, idx, what)?, TAG_BOOLEAN, what)?.as_bool()?)
}

fn message_id_from(el: &BerElement) -> std::result::Result<i32, BerError> {
    let id = universal(el, TAG_INTEGER, "messageID")?.as_integer()?;
    i32::try_from(id)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| BerError::Malformed(format!("messageID {} out of range", id)))
}

/// Decode the LDAPMessage envelope. Any error here is connection-fatal.
pub fn parse_ldap_message(data: &[u8]) -> std::result::Result<LdapMessage, BerError> {
    let root = BerElement::parse(data)?;
    let parts = universal(&root, TAG_SEQUENCE, "LDAPMessage")?.children()?;
    if parts.len() < 2 || parts.len() > 3 {
        return Err(BerError::Malformed(format!(
            "LDAPMessage has {} elements",
            parts.len()
        )));
    }
    let message_id = message_id_from(&parts[0])?;

    let op = &parts[1];
    if op.class != TagClass::Application {
        return Err(BerError::Malformed(format!(
            "protocolOp is not an application tag ({:?} {})",
            op.class, op.tag
        )));
    }
    let protocol_op = match (op.tag, op.is_constructed()) {
        (0, true) => ProtocolOp::BindRequest(op.clone()),
        (2, false) => ProtocolOp::UnbindRequest,
        (3, true) => ProtocolOp::SearchRequest(op.clone()),
        (6, true) => ProtocolOp::ModifyRequest(op.clone()),
        (8, true) => ProtocolOp::AddRequest(op.clone()),
        (10, false) => ProtocolOp::DelRequest(op.clone()),
        (12, true) => ProtocolOp::ModifyDNRequest(op.clone()),
        (14, true) => ProtocolOp::CompareRequest(op.clone()),
        (16, false) => ProtocolOp::AbandonRequest(message_id_from_abandon(op)?),
        (23, true) => ProtocolOp::ExtendedRequest(parse_extended_request(op)?),
        (tag, _) => ProtocolOp::Unrecognized(tag),
    };

    let controls = match parts.get(2) {
        Some(el) if el.is(TagClass::Context, LDAP_CONTEXT_CONTROLS) => parse_controls(el)?,
        Some(el) => {
            return Err(BerError::Malformed(format!(
                "unexpected element after protocolOp ({:?} {})",
                el.class, el.tag
            )))
        }
        None => Vec::new(),
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn message_id_from_abandon(op: &BerElement) -> std::result::Result<i32, BerError> {
    let id = op.as_integer()?;
    i32::try_from(id).map_err(|_| BerError::Malformed(format!("abandon id {} out of range", id)))
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(el: &BerElement) -> std::result::Result<Vec<Control>, BerError> {
    let mut controls = Vec::new();
    for ctrl in el.children()? {
        let parts = universal(ctrl, TAG_SEQUENCE, "Control")?.children()?;
        let ctype = match parts.first() {
            Some(t) => universal(t, TAG_OCTET_STRING, "controlType")?.as_string()?,
            None => return Err(BerError::Malformed("empty Control".to_string())),
        };
        let mut critical = false;
        let mut value = None;
        for part in &parts[1..] {
            if part.is(TagClass::Universal, TAG_BOOLEAN) {
                critical = part.as_bool()?;
            } else if part.is(TagClass::Universal, TAG_OCTET_STRING) {
                value = Some(part.bytes()?.to_vec());
            } else {
                return Err(BerError::Malformed(format!(
                    "unexpected element in Control {}",
                    ctype
                )));
            }
        }
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

fn parse_extended_request(op: &BerElement) -> std::result::Result<ExtendedRequest, BerError> {
    let parts = op.children()?;
    let name = match parts.first() {
        Some(el) if el.is(TagClass::Context, 0) => el.as_string()?,
        _ => return Err(BerError::Malformed("ExtendedRequest without requestName".to_string())),
    };
    let value = match parts.get(1) {
        Some(el) if el.is(TagClass::Context, 1) => Some(el.bytes()?.to_vec()),
        Some(_) => return Err(BerError::Malformed("bad ExtendedRequest requestValue".to_string())),
        None => None,
    };
    Ok(ExtendedRequest { name, value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let version = int_at(parts, 0, "bind version")?;
        let name = string_at(parts, 1, "bind name")?;
        let auth = field(parts, 2, "authentication")?;
        let authentication = if auth.is(TagClass::Context, 0) {
            BindAuthentication::Simple(auth.bytes()?.to_vec())
        } else if auth.is(TagClass::Context, 3) {
            let sasl = auth.children()?;
            BindAuthentication::Sasl {
                mechanism: string_at(sasl, 0, "SASL mechanism")?,
                credentials: match sasl.get(1) {
                    Some(c) => Some(c.bytes()?.to_vec()),
                    None => None,
                },
            }
        } else {
            return protocol_error(format!(
                "unrecognised authentication choice [{}]",
                auth.tag
            ));
        };
        Ok(BindRequest {
            version: i32::try_from(version)
                .map_err(|_| LdapError::protocol("bind version out of range"))?,
            name,
            authentication,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = LdapError;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => protocol_error(format!("invalid search scope: {}", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => protocol_error(format!("invalid derefAliases: {}", value)),
        }
    }
}

/// The Filter CHOICE as it arrives on the wire, before schema resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFilter {
    And(Vec<RawFilter>),
    Or(Vec<RawFilter>),
    Not(Box<RawFilter>),
    EqualityMatch(String, String),
    Substrings {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Present(String),
    ApproxMatch(String, String),
    ExtensibleMatch {
        rule: Option<String>,
        attr: Option<String>,
        value: String,
        dn_attributes: bool,
    },
}

fn parse_ava(el: &BerElement) -> Result<(String, String)> {
    let parts = el.children()?;
    let attr = string_at(parts, 0, "attributeDesc")?;
    let value = universal(field(parts, 1, "assertionValue")?, TAG_OCTET_STRING, "assertionValue")?
        .as_value()?;
    Ok((attr, value))
}

impl RawFilter {
    pub fn decode(el: &BerElement) -> Result<Self> {
        if el.class != TagClass::Context {
            return protocol_error(format!("filter with non-context tag {:?} {}", el.class, el.tag));
        }
        match el.tag {
            0 | 1 => {
                let children = el
                    .children()?
                    .iter()
                    .map(RawFilter::decode)
                    .collect::<Result<Vec<_>>>()?;
                Ok(if el.tag == 0 {
                    RawFilter::And(children)
                } else {
                    RawFilter::Or(children)
                })
            }
            2 => match el.children()? {
                [inner] => Ok(RawFilter::Not(Box::new(RawFilter::decode(inner)?))),
                other => protocol_error(format!("not filter with {} children", other.len())),
            },
            3 => {
                let (a, v) = parse_ava(el)?;
                Ok(RawFilter::EqualityMatch(a, v))
            }
            4 => {
                let parts = el.children()?;
                let attr = string_at(parts, 0, "substrings type")?;
                let subs = universal(field(parts, 1, "substrings")?, TAG_SEQUENCE, "substrings")?
                    .children()?;
                if subs.is_empty() {
                    return protocol_error("substrings filter without components");
                }
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                for (i, sub) in subs.iter().enumerate() {
                    if sub.class != TagClass::Context {
                        return protocol_error("substring component with non-context tag");
                    }
                    let value = sub.as_value()?;
                    match sub.tag {
                        0 if i == 0 => initial = Some(value),
                        1 if final_.is_none() => any.push(value),
                        2 if final_.is_none() && i == subs.len() - 1 => final_ = Some(value),
                        tag => {
                            return protocol_error(format!(
                                "substring component [{}] out of order",
                                tag
                            ))
                        }
                    }
                }
                Ok(RawFilter::Substrings {
                    attr,
                    initial,
                    any,
                    final_,
                })
            }
            5 => {
                let (a, v) = parse_ava(el)?;
                Ok(RawFilter::GreaterOrEqual(a, v))
            }
            6 => {
                let (a, v) = parse_ava(el)?;
                Ok(RawFilter::LessOrEqual(a, v))
            }
            7 => Ok(RawFilter::Present(el.as_string()?)),
            8 => {
                let (a, v) = parse_ava(el)?;
                Ok(RawFilter::ApproxMatch(a, v))
            }
            9 => {
                let mut rule = None;
                let mut attr = None;
                let mut value = None;
                let mut dn_attributes = false;
                for part in el.children()? {
                    match (part.class, part.tag) {
                        (TagClass::Context, 1) => rule = Some(part.as_string()?),
                        (TagClass::Context, 2) => attr = Some(part.as_string()?),
                        (TagClass::Context, 3) => value = Some(part.as_value()?),
                        (TagClass::Context, 4) => dn_attributes = part.as_bool()?,
                        _ => return protocol_error("unexpected element in extensibleMatch"),
                    }
                }
                let value = value.ok_or_else(|| LdapError::protocol("extensibleMatch without matchValue"))?;
                Ok(RawFilter::ExtensibleMatch {
                    rule,
                    attr,
                    value,
                    dn_attributes,
                })
            }
            tag => protocol_error(format!("unrecognised filter type [{}]", tag)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    pub filter: RawFilter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let base_object = string_at(parts, 0, "baseObject")?;
        let scope = SearchScope::try_from(enum_at(parts, 1, "scope")?)?;
        let deref_aliases = DerefAliases::try_from(enum_at(parts, 2, "derefAliases")?)?;
        let size_limit = int_at(parts, 3, "sizeLimit")?;
        let time_limit = int_at(parts, 4, "timeLimit")?;
        let types_only = bool_at(parts, 5, "typesOnly")?;
        let filter = RawFilter::decode(field(parts, 6, "filter")?)?;
        let attributes = universal(field(parts, 7, "attributes")?, TAG_SEQUENCE, "attributes")?
            .children()?
            .iter()
            .map(|a| -> Result<String> {
                Ok(universal(a, TAG_OCTET_STRING, "attribute selector")?.as_string()?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SearchRequest {
            base_object,
            scope,
            deref_aliases,
            size_limit,
            time_limit,
            types_only,
            filter,
            attributes,
        })
    }
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_partial_attribute(el: &BerElement) -> Result<(String, Vec<String>)> {
    let parts = universal(el, TAG_SEQUENCE, "PartialAttribute")?.children()?;
    let attr = string_at(parts, 0, "attribute type")?;
    let values = universal(field(parts, 1, "attribute values")?, TAG_SET, "attribute values")?
        .children()?
        .iter()
        .map(|v| -> Result<String> {
            Ok(universal(v, TAG_OCTET_STRING, "attribute value")?.as_value()?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((attr, values))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<Modification>,
}

impl ModifyRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let object = string_at(parts, 0, "object")?;
        let mut changes = Vec::new();
        for change in universal(field(parts, 1, "changes")?, TAG_SEQUENCE, "changes")?.children()? {
            let c = universal(change, TAG_SEQUENCE, "change")?.children()?;
            let op = ModifyOperation::from_wire(enum_at(c, 0, "operation")?)
                .ok_or_else(|| LdapError::protocol("unknown modify operation"))?;
            let (attr, values) = parse_partial_attribute(field(c, 1, "modification")?)?;
            changes.push(Modification { op, attr, values });
        }
        Ok(ModifyRequest { object, changes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Attributes,
}

impl AddRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let entry = string_at(parts, 0, "entry")?;
        let mut attributes = Attributes::new();
        for attr in universal(field(parts, 1, "attributes")?, TAG_SEQUENCE, "attributes")?.children()? {
            let (name, values) = parse_partial_attribute(attr)?;
            if attributes.keys().any(|k| k.eq_ignore_ascii_case(&name)) {
                return Err(LdapError::new(ResultCode::AttributeOrValueExists, name));
            }
            attributes.insert(name, values);
        }
        Ok(AddRequest { entry, attributes })
    }
}

/// DelRequest ::= [APPLICATION 10] LDAPDN
pub fn decode_del_request(op: &BerElement) -> Result<String> {
    Ok(op.as_string()?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ModifyDnRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let entry = string_at(parts, 0, "entry")?;
        let new_rdn = string_at(parts, 1, "newrdn")?;
        let delete_old_rdn = bool_at(parts, 2, "deleteoldrdn")?;
        let new_superior = match parts.get(3) {
            Some(el) if el.is(TagClass::Context, 0) => Some(el.as_string()?),
            Some(_) => return protocol_error("bad newSuperior"),
            None => None,
        };
        Ok(ModifyDnRequest {
            entry,
            new_rdn,
            delete_old_rdn,
            new_superior,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub value: String,
}

impl CompareRequest {
    pub fn decode(op: &BerElement) -> Result<Self> {
        let parts = op.children()?;
        let entry = string_at(parts, 0, "entry")?;
        let ava = universal(field(parts, 1, "ava")?, TAG_SEQUENCE, "ava")?;
        let (attr, value) = parse_ava(ava)?;
        Ok(CompareRequest { entry, attr, value })
    }
}

/// LDAPResult components shared by every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
    pub referral: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
            referral: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }
}

impl From<&LdapError> for LdapResult {
    fn from(err: &LdapError) -> Self {
        LdapResult::new(err.code, err.message.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind(LdapResult),
    SearchEntry {
        dn: String,
        attributes: Vec<(String, Vec<String>)>,
    },
    SearchReference(Vec<String>),
    SearchDone(LdapResult),
    Modify(LdapResult),
    Add(LdapResult),
    Delete(LdapResult),
    ModifyDn(LdapResult),
    Compare(LdapResult),
    Extended {
        result: LdapResult,
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
}

fn encode_ldap_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.message);
    if !result.referral.is_empty() {
        let pos = writer.start_constructed(0xA3);
        for uri in &result.referral {
            writer.write_string(uri);
        }
        writer.end(pos);
    }
}

fn encode_result_op(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.start_constructed(tag);
    encode_ldap_result(writer, result);
    writer.end(pos);
}

/// Encode one complete LDAPMessage carrying `response`.
pub fn encode_response(message_id: i32, response: &Response) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(message_id as i64);
    match response {
        Response::Bind(r) => encode_result_op(&mut writer, LDAP_TAG_BIND_RESPONSE, r),
        Response::SearchEntry { dn, attributes } => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
            writer.write_string(dn);
            let attrs = writer.start_sequence();
            for (name, values) in attributes {
                let attr = writer.start_sequence();
                writer.write_string(name);
                let set = writer.start_set();
                for v in values {
                    writer.write_string(v);
                }
                writer.end(set);
                writer.end(attr);
            }
            writer.end(attrs);
            writer.end(pos);
        }
        Response::SearchReference(uris) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end(pos);
        }
        Response::SearchDone(r) => encode_result_op(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, r),
        Response::Modify(r) => encode_result_op(&mut writer, LDAP_TAG_MODIFY_RESPONSE, r),
        Response::Add(r) => encode_result_op(&mut writer, LDAP_TAG_ADD_RESPONSE, r),
        Response::Delete(r) => encode_result_op(&mut writer, LDAP_TAG_DEL_RESPONSE, r),
        Response::ModifyDn(r) => encode_result_op(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, r),
        Response::Compare(r) => encode_result_op(&mut writer, LDAP_TAG_COMPARE_RESPONSE, r),
        Response::Extended {
            result,
            name,
            value,
        } => {
            let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
            encode_ldap_result(&mut writer, result);
            if let Some(name) = name {
                writer.write_primitive(0x8A, name.as_bytes());
            }
            if let Some(value) = value {
                writer.write_primitive(0x8B, value);
            }
            writer.end(pos);
        }
    }
    writer.end(seq);
    writer.into_bytes()
}

/// Unsolicited notification sent just before the server drops a connection.
pub fn encode_notice_of_disconnection(code: ResultCode, message: &str) -> Vec<u8> {
    encode_response(
        0,
        &Response::Extended {
            result: LdapResult::new(code, message),
            name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            value: None,
        },
    )
}

/// Request encoders and a response decoder, so tests can speak the protocol
/// from the client side.
#[cfg(test)]
pub(crate) mod client {
    use super::*;

    pub fn message(message_id: i32, body: impl FnOnce(&mut BerWriter)) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(message_id as i64);
        body(&mut w);
        w.end(seq);
        w.into_bytes()
    }

    pub fn bind(message_id: i32, version: i64, dn: &str, password: &str) -> Vec<u8> {
        message(message_id, |w| {
            let op = w.start_constructed(LDAP_TAG_BIND_REQUEST);
            w.write_integer(version);
            w.write_string(dn);
            w.write_primitive(0x80, password.as_bytes());
            w.end(op);
        })
    }

    pub fn unbind(message_id: i32) -> Vec<u8> {
        message(message_id, |w| w.write_primitive(LDAP_TAG_UNBIND_REQUEST, &[]))
    }

    pub fn abandon(message_id: i32, target: i32) -> Vec<u8> {
        message(message_id, |w| w.write_integer_tagged(LDAP_TAG_ABANDON_REQUEST, target as i64))
    }

    pub fn write_filter(w: &mut BerWriter, filter: &RawFilter) {
        let ava = |w: &mut BerWriter, tag: u8, a: &str, v: &str| {
            let pos = w.start_constructed(tag);
            w.write_string(a);
            w.write_string(v);
            w.end(pos);
        };
        match filter {
            RawFilter::And(c) | RawFilter::Or(c) => {
                let tag = if matches!(filter, RawFilter::And(_)) { 0xA0 } else { 0xA1 };
                let pos = w.start_constructed(tag);
                for f in c {
                    write_filter(w, f);
                }
                w.end(pos);
            }
            RawFilter::Not(inner) => {
                let pos = w.start_constructed(0xA2);
                write_filter(w, inner);
                w.end(pos);
            }
            RawFilter::EqualityMatch(a, v) => ava(w, 0xA3, a, v),
            RawFilter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                let pos = w.start_constructed(0xA4);
                w.write_string(attr);
                let seq = w.start_sequence();
                if let Some(i) = initial {
                    w.write_primitive(0x80, i.as_bytes());
                }
                for a in any {
                    w.write_primitive(0x81, a.as_bytes());
                }
                if let Some(f) = final_ {
                    w.write_primitive(0x82, f.as_bytes());
                }
                w.end(seq);
                w.end(pos);
            }
            RawFilter::GreaterOrEqual(a, v) => ava(w, 0xA5, a, v),
            RawFilter::LessOrEqual(a, v) => ava(w, 0xA6, a, v),
            RawFilter::Present(a) => w.write_primitive(0x87, a.as_bytes()),
            RawFilter::ApproxMatch(a, v) => ava(w, 0xA8, a, v),
            RawFilter::ExtensibleMatch { value, .. } => {
                let pos = w.start_constructed(0xA9);
                w.write_primitive(0x83, value.as_bytes());
                w.end(pos);
            }
        }
    }

    pub fn search(
        message_id: i32,
        base: &str,
        scope: SearchScope,
        size_limit: i64,
        filter: &RawFilter,
        attrs: &[&str],
    ) -> Vec<u8> {
        message(message_id, |w| {
            let op = w.start_constructed(LDAP_TAG_SEARCH_REQUEST);
            w.write_string(base);
            w.write_enumerated(scope as u32);
            w.write_enumerated(0);
            w.write_integer(size_limit);
            w.write_integer(0);
            w.write_boolean(false);
            write_filter(w, filter);
            let seq = w.start_sequence();
            for a in attrs {
                w.write_string(a);
            }
            w.end(seq);
            w.end(op);
        })
    }

    pub fn add(message_id: i32, dn: &str, attrs: &[(&str, &[&str])]) -> Vec<u8> {
        message(message_id, |w| {
            let op = w.start_constructed(LDAP_TAG_ADD_REQUEST);
            w.write_string(dn);
            let list = w.start_sequence();
            for (name, values) in attrs {
                let a = w.start_sequence();
                w.write_string(name);
                let set = w.start_set();
                for v in *values {
                    w.write_string(v);
                }
                w.end(set);
                w.end(a);
            }
            w.end(list);
            w.end(op);
        })
    }

    pub fn delete(message_id: i32, dn: &str) -> Vec<u8> {
        message(message_id, |w| w.write_primitive(LDAP_TAG_DEL_REQUEST, dn.as_bytes()))
    }

    pub fn compare(message_id: i32, dn: &str, attr: &str, value: &str) -> Vec<u8> {
        message(message_id, |w| {
            let op = w.start_constructed(LDAP_TAG_COMPARE_REQUEST);
            w.write_string(dn);
            let ava = w.start_sequence();
            w.write_string(attr);
            w.write_string(value);
            w.end(ava);
            w.end(op);
        })
    }

    pub fn extended(message_id: i32, name: &str) -> Vec<u8> {
        message(message_id, |w| {
            let op = w.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
            w.write_primitive(0x80, name.as_bytes());
            w.end(op);
        })
    }

    /// A response as seen by a client: message id, protocolOp tag, result code
    /// (for result-bearing ops), and the entry DN/attributes for search entries.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Reply {
        pub message_id: i32,
        pub tag: u8,
        pub code: Option<u32>,
        pub message: String,
        pub dn: Option<String>,
        pub attributes: Vec<(String, Vec<String>)>,
        pub name: Option<String>,
    }

    pub fn decode_reply(data: &[u8]) -> Reply {
        let root = BerElement::parse(data).unwrap();
        let parts = root.children().unwrap();
        let message_id = parts[0].as_integer().unwrap() as i32;
        let op = &parts[1];
        let constructed: u8 = if op.is_constructed() { 0x20 } else { 0 };
        let tag = 0x40 | constructed | op.tag as u8;
        let mut reply = Reply {
            message_id,
            tag,
            code: None,
            message: String::new(),
            dn: None,
            attributes: Vec::new(),
            name: None,
        };
        let body = op.children().unwrap();
        if tag == LDAP_TAG_SEARCH_RESULT_ENTRY {
            reply.dn = Some(body[0].as_string().unwrap());
            for attr in body[1].children().unwrap() {
                let a = attr.children().unwrap();
                let values = a[1]
                    .children()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_string().unwrap())
                    .collect();
                reply.attributes.push((a[0].as_string().unwrap(), values));
            }
        } else {
            reply.code = Some(body[0].as_integer().unwrap() as u32);
            reply.message = body[2].as_string().unwrap();
            for el in &body[3..] {
                if el.is(TagClass::Context, 10) {
                    reply.name = Some(el.as_string().unwrap());
                }
            }
        }
        reply
    }
}
