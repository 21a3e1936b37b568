//! The storage side of the server: the `Backend` trait every directory
//! implementation provides, the per-request context handed to it, and the
//! `SearchSink` through which search results flow back to the client.

use crate::entry::{Attributes, Modification};
use crate::filter::Filter;
use crate::ldap_protocol::Response;
use crate::result::{Abandoned, LdapError, ResultCode};
use crate::schema::Schema;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use crate::ldap_protocol::{DerefAliases, SearchScope};

/// What a backend hook knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub message_id: i32,
    /// DN of the bound identity; `None` when anonymous.
    pub bind_dn: Option<String>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(message_id: i32, bind_dn: Option<String>, token: CancellationToken) -> Self {
        Self {
            message_id,
            bind_dn,
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// For backends doing long work in steps: fails with `Abandoned` once the
    /// client abandoned the request, or TimeLimitExceeded past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Abandoned.into());
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LdapError::from(ResultCode::TimeLimitExceeded).into());
        }
        Ok(())
    }
}

/// Directory storage. Hooks report domain failures by returning an
/// `LdapError` (directly or wrapped in `anyhow`); that code goes back to the
/// client. Any other error is logged and answered with operationsError.
///
/// Unimplemented hooks answer unwillingToPerform.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Simple bind. The default accepts anonymous LDAPv3 binds only.
    async fn simple_bind(&self, ctx: &RequestContext, version: i32, dn: &str, password: &str) -> Result<()> {
        let _ = (ctx, password);
        if version != 3 {
            return Err(LdapError::protocol("version 3 only").into());
        }
        if !dn.is_empty() {
            return Err(LdapError::new(
                ResultCode::InappropriateAuthentication,
                "This server only supports anonymous bind",
            )
            .into());
        }
        Ok(())
    }

    /// Emit every entry under `base` within `scope` that `filter` evaluates
    /// true for. Emission through `sink` applies the size limit and the
    /// client's attribute selection.
    async fn search(
        &self,
        ctx: &RequestContext,
        base: &str,
        scope: SearchScope,
        deref: DerefAliases,
        filter: &Filter,
        sink: &mut SearchSink,
    ) -> Result<()> {
        let _ = (ctx, base, scope, deref, filter, sink);
        Err(LdapError::unwilling("search not implemented").into())
    }

    async fn modify(&self, ctx: &RequestContext, dn: &str, mods: &[Modification]) -> Result<()> {
        let _ = (ctx, dn, mods);
        Err(LdapError::unwilling("modify not implemented").into())
    }

    async fn add(&self, ctx: &RequestContext, dn: &str, attrs: &Attributes) -> Result<()> {
        let _ = (ctx, dn, attrs);
        Err(LdapError::unwilling("add not implemented").into())
    }

    async fn delete(&self, ctx: &RequestContext, dn: &str) -> Result<()> {
        let _ = (ctx, dn);
        Err(LdapError::unwilling("delete not implemented").into())
    }

    async fn modify_dn(
        &self,
        ctx: &RequestContext,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<()> {
        let _ = (ctx, dn, new_rdn, delete_old_rdn, new_superior);
        Err(LdapError::unwilling("modifydn not implemented").into())
    }

    /// `Ok(true)` is compareTrue, `Ok(false)` compareFalse.
    async fn compare(&self, ctx: &RequestContext, dn: &str, attr: &str, value: &str) -> Result<bool> {
        let _ = (ctx, dn, attr, value);
        Err(LdapError::unwilling("compare not implemented").into())
    }
}

/// Where responses for one message ID are written. Implemented by the
/// connection's serialized writer.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    async fn write_response(&self, message_id: i32, response: &Response) -> Result<()>;
}

/// Attribute names that are operational even without a schema to say so.
const KNOWN_OPERATIONAL: &[&str] = &[
    "supportedLDAPVersion",
    "namingContexts",
    "subschemaSubentry",
    "supportedExtension",
    "supportedControl",
    "supportedSASLMechanisms",
    "supportedFeatures",
    "vendorName",
    "vendorVersion",
    "altServer",
    "createTimestamp",
    "modifyTimestamp",
    "creatorsName",
    "modifiersName",
    "hasSubordinates",
    "structuralObjectClass",
    "objectClasses",
    "attributeTypes",
    "ldapSyntaxes",
    "matchingRules",
    "matchingRuleUse",
];

/// The attribute list of a SearchRequest: `*` (or nothing) for all user
/// attributes, `+` for all operational ones, `1.1` for none, plus names.
#[derive(Debug, Clone)]
pub struct AttributeSelection {
    all_user: bool,
    all_operational: bool,
    names: Vec<String>,
    types_only: bool,
    schema: Option<Arc<Schema>>,
}

impl AttributeSelection {
    pub fn new(requested: &[String], types_only: bool, schema: Option<Arc<Schema>>) -> Self {
        let mut sel = Self {
            all_user: requested.is_empty(),
            all_operational: false,
            names: Vec::new(),
            types_only,
            schema,
        };
        for name in requested {
            match name.as_str() {
                "*" => sel.all_user = true,
                "+" => sel.all_operational = true,
                "1.1" => {}
                _ => sel.names.push(name.clone()),
            }
        }
        sel
    }

    fn is_operational(&self, name: &str) -> bool {
        match self.schema.as_ref().and_then(|s| s.attribute_type(name)) {
            Some(at) => at.is_operational(),
            None => KNOWN_OPERATIONAL.iter().any(|n| n.eq_ignore_ascii_case(name)),
        }
    }

    fn same_attribute(&self, a: &str, b: &str) -> bool {
        if a.eq_ignore_ascii_case(b) {
            return true;
        }
        match &self.schema {
            Some(schema) => match (schema.attribute_type(a), schema.attribute_type(b)) {
                (Some(x), Some(y)) => x.oid == y.oid,
                _ => false,
            },
            None => false,
        }
    }

    pub fn wants(&self, name: &str) -> bool {
        if self.names.iter().any(|n| self.same_attribute(n, name)) {
            return true;
        }
        if self.is_operational(name) {
            self.all_operational
        } else {
            self.all_user
        }
    }

    /// The attributes of `attrs` to send, values dropped when types-only.
    pub fn project(&self, attrs: &Attributes) -> Vec<(String, Vec<String>)> {
        attrs
            .iter()
            .filter(|(name, _)| self.wants(name))
            .map(|(name, values)| {
                let values = if self.types_only { Vec::new() } else { values.clone() };
                (name.clone(), values)
            })
            .collect()
    }
}

/// Sends SearchResultEntry responses for one search, enforcing the size
/// limit: once `size_limit` entries have gone out the next one fails with
/// SizeLimitExceeded and is not sent.
pub struct SearchSink {
    message_id: i32,
    writer: Arc<dyn ResponseWriter>,
    selection: AttributeSelection,
    size_limit: Option<usize>,
    sent: usize,
    token: CancellationToken,
}

impl SearchSink {
    pub fn new(
        message_id: i32,
        writer: Arc<dyn ResponseWriter>,
        selection: AttributeSelection,
        size_limit: Option<usize>,
        token: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            writer,
            selection,
            size_limit,
            sent: 0,
            token,
        }
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub async fn send_entry(&mut self, dn: &str, attrs: &Attributes) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Abandoned.into());
        }
        if self.size_limit.is_some_and(|limit| self.sent >= limit) {
            return Err(LdapError::from(ResultCode::SizeLimitExceeded).into());
        }
        let response = Response::SearchEntry {
            dn: dn.to_string(),
            attributes: self.selection.project(attrs),
        };
        self.writer.write_response(self.message_id, &response).await?;
        self.sent += 1;
        Ok(())
    }

    /// A continuation reference (RFC 4511 section 4.5.3).
    pub async fn send_reference(&mut self, uris: Vec<String>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Abandoned.into());
        }
        self.writer
            .write_response(self.message_id, &Response::SearchReference(uris))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Collects responses instead of writing them to a socket.
    #[derive(Default)]
    pub struct RecordingWriter {
        pub responses: Mutex<Vec<(i32, Response)>>,
    }

    #[async_trait]
    impl ResponseWriter for RecordingWriter {
        async fn write_response(&self, message_id: i32, response: &Response) -> Result<()> {
            self.responses.lock().await.push((message_id, response.clone()));
            Ok(())
        }
    }
}
