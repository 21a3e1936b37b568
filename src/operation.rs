//! One LDAP request: decode the request body, call the backend hook, and
//! turn the outcome into exactly one response (or none, when abandoned).

use crate::backend::{AttributeSelection, RequestContext, ResponseWriter, SearchSink};
use crate::ber::BerElement;
use crate::dn::normalize_dn;
use crate::entry::Attributes;
use crate::filter::Filter;
use crate::ldap_protocol::{
    decode_del_request, AddRequest, BindAuthentication, BindRequest, CompareRequest, Control, LdapResult,
    ModifyDnRequest, ModifyRequest, OpKind, ProtocolOp, Response, SearchRequest, SearchScope,
};
use crate::result::{Abandoned, LdapError, ResultCode};
use crate::server::ServerContext;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Wrap `result` in the response type that answers an `op` request.
/// Unbind and abandon are never answered.
pub fn result_response(op: OpKind, result: LdapResult) -> Option<Response> {
    match op {
        OpKind::Bind => Some(Response::Bind(result)),
        OpKind::Search => Some(Response::SearchDone(result)),
        OpKind::Modify => Some(Response::Modify(result)),
        OpKind::Add => Some(Response::Add(result)),
        OpKind::Delete => Some(Response::Delete(result)),
        OpKind::ModifyDn => Some(Response::ModifyDn(result)),
        OpKind::Compare => Some(Response::Compare(result)),
        OpKind::Extended => Some(Response::Extended {
            result,
            name: None,
            value: None,
        }),
        OpKind::Unbind | OpKind::Abandon | OpKind::Unknown => None,
    }
}

fn is_success(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse
    )
}

fn reject_critical(controls: &[Control]) -> Result<(), LdapError> {
    match controls.iter().find(|c| c.critical) {
        Some(c) => Err(LdapError::new(
            ResultCode::UnavailableCriticalExtension,
            format!("unsupported critical control {}", c.ctype),
        )),
        None => Ok(()),
    }
}

/// Server limit capped by the client's, where zero means "no limit".
fn effective_size_limit(server: Option<usize>, client: i64) -> Option<usize> {
    let client = usize::try_from(client).ok().filter(|c| *c > 0);
    match (server, client) {
        (Some(s), Some(c)) => Some(s.min(c)),
        (s, c) => s.or(c),
    }
}

fn effective_time_limit(server: Duration, client: i64) -> Option<Duration> {
    let server = Some(server).filter(|d| !d.is_zero());
    let client = u64::try_from(client).ok().filter(|c| *c > 0).map(Duration::from_secs);
    match (server, client) {
        (Some(s), Some(c)) => Some(s.min(c)),
        (s, c) => s.or(c),
    }
}

fn same_dn(a: &str, b: &str) -> bool {
    match (normalize_dn(a), normalize_dn(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

pub struct Operation {
    ctx: Arc<ServerContext>,
    writer: Arc<dyn ResponseWriter>,
    message_id: i32,
    bind_dn: Option<String>,
    token: CancellationToken,
}

impl Operation {
    pub fn new(
        ctx: Arc<ServerContext>,
        writer: Arc<dyn ResponseWriter>,
        message_id: i32,
        bind_dn: Option<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            writer,
            message_id,
            bind_dn,
            token,
        }
    }

    fn request_context(&self) -> RequestContext {
        RequestContext::new(self.message_id, self.bind_dn.clone(), self.token.clone())
    }

    /// Run any request that gets its own task. Bind, unbind, abandon and
    /// extended requests are the connection's business.
    pub async fn dispatch(&self, op: ProtocolOp, controls: &[Control]) -> Result<()> {
        match op {
            ProtocolOp::SearchRequest(body) => self.do_search(&body, controls).await,
            ProtocolOp::ModifyRequest(body) => self.do_modify(&body, controls).await,
            ProtocolOp::AddRequest(body) => self.do_add(&body, controls).await,
            ProtocolOp::DelRequest(body) => self.do_del(&body, controls).await,
            ProtocolOp::ModifyDNRequest(body) => self.do_modifydn(&body, controls).await,
            ProtocolOp::CompareRequest(body) => self.do_compare(&body, controls).await,
            other => Err(anyhow::anyhow!("{} cannot be dispatched as an operation", other.name())),
        }
    }

    /// The error boundary: a domain error becomes its result code, an
    /// abandon becomes silence, anything else is logged and reported as
    /// operationsError.
    fn boundary(&self, op: OpKind, outcome: Result<LdapResult>) -> Option<LdapResult> {
        match outcome {
            Ok(result) => Some(result),
            Err(err) if err.is::<Abandoned>() => {
                debug!("{} (message {}) abandoned", op.name(), self.message_id);
                None
            }
            Err(err) => match err.downcast_ref::<LdapError>() {
                Some(e) => Some(LdapResult::from(e)),
                None => {
                    error!("{} (message {}) failed: {:#}", op.name(), self.message_id, err);
                    Some(LdapResult::new(ResultCode::OperationsError, format!("{:#}", err)))
                }
            },
        }
    }

    async fn respond(&self, op: OpKind, started: Instant, outcome: Result<LdapResult>) -> Result<()> {
        let Some(result) = self.boundary(op, outcome) else {
            return Ok(());
        };
        self.ctx.metrics.record(op.name(), is_success(result.code), started.elapsed());
        if self.token.is_cancelled() {
            return Ok(());
        }
        let Some(response) = result_response(op, result) else {
            return Ok(());
        };
        match self.writer.write_response(self.message_id, &response).await {
            Err(e) if e.is::<Abandoned>() => Ok(()),
            other => other,
        }
    }

    /// Bind runs in the read loop. Domain errors are answered; anything else
    /// propagates to the connection. Returns the new identity: `None` for
    /// anonymous or after a failed bind.
    pub async fn do_bind(&self, op: &BerElement, controls: &[Control]) -> Result<Option<String>> {
        let started = Instant::now();
        let (result, identity) = match self.bind(op, controls).await {
            Ok(identity) => (LdapResult::success(), identity),
            Err(err) => match err.downcast::<LdapError>() {
                Ok(e) => (LdapResult::from(&e), None),
                Err(err) => {
                    self.ctx.metrics.record(OpKind::Bind.name(), false, started.elapsed());
                    return Err(err);
                }
            },
        };
        self.ctx.metrics.record(OpKind::Bind.name(), is_success(result.code), started.elapsed());
        self.writer.write_response(self.message_id, &Response::Bind(result)).await?;
        Ok(identity)
    }

    async fn bind(&self, op: &BerElement, controls: &[Control]) -> Result<Option<String>> {
        reject_critical(controls)?;
        let req = BindRequest::decode(op)?;
        match req.authentication {
            BindAuthentication::Simple(password) => {
                let password = String::from_utf8_lossy(&password);
                self.ctx
                    .backend
                    .simple_bind(&self.request_context(), req.version, &req.name, &password)
                    .await?;
                Ok(Some(req.name).filter(|dn| !dn.is_empty()))
            }
            BindAuthentication::Sasl { mechanism, .. } => Err(LdapError::new(
                ResultCode::AuthMethodNotSupported,
                format!("SASL mechanism {} not supported", mechanism),
            )
            .into()),
        }
    }

    pub async fn do_search(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.search(op, controls).await;
        self.respond(OpKind::Search, started, outcome).await
    }

    async fn search(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let req = SearchRequest::decode(op)?;
        let schema = self.ctx.schema.clone();
        let filter = Filter::parse(&req.filter, schema.as_deref());
        let selection = AttributeSelection::new(&req.attributes, req.types_only, schema.clone());
        let size_limit = effective_size_limit(self.ctx.limits.size_limit, req.size_limit);
        let mut sink = SearchSink::new(
            self.message_id,
            Arc::clone(&self.writer),
            selection,
            size_limit,
            self.token.clone(),
        );

        if req.base_object.is_empty() && req.scope == SearchScope::BaseObject {
            let dse = self.ctx.root_dse();
            if filter.eval(dse).is_true() {
                sink.send_entry("", dse).await?;
            }
            return Ok(LdapResult::success());
        }
        if let Some(schema) = &schema {
            if same_dn(&req.base_object, &schema.subschema_dn()) {
                let subentry = schema.subschema_subentry();
                if filter.eval(subentry).is_true() {
                    sink.send_entry(&req.base_object, subentry).await?;
                }
                return Ok(LdapResult::success());
            }
        }

        let deadline = effective_time_limit(self.ctx.limits.time_limit(), req.time_limit)
            .map(|limit| Instant::now() + limit);
        let mut rctx = self.request_context();
        if let Some(at) = deadline {
            rctx = rctx.with_deadline(at);
        }
        let search = self.ctx.backend.search(
            &rctx,
            &req.base_object,
            req.scope,
            req.deref_aliases,
            &filter,
            &mut sink,
        );
        let bounded = async {
            match deadline {
                Some(at) => match tokio::time::timeout_at(at, search).await {
                    Ok(res) => res,
                    Err(_) => Err(LdapError::new(ResultCode::TimeLimitExceeded, "time limit exceeded").into()),
                },
                None => search.await,
            }
        };
        tokio::select! {
            _ = self.token.cancelled() => Err(Abandoned.into()),
            res = bounded => res.map(|()| LdapResult::success()),
        }
    }

    pub async fn do_modify(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.modify(op, controls).await;
        self.respond(OpKind::Modify, started, outcome).await
    }

    async fn modify(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let req = ModifyRequest::decode(op)?;
        let mut changes = req.changes;
        if let Some(schema) = &self.ctx.schema {
            for change in &mut changes {
                change.attr = schema.find_attribute_type(&change.attr)?.name().to_string();
            }
        }
        self.ctx
            .backend
            .modify(&self.request_context(), &req.object, &changes)
            .await?;
        Ok(LdapResult::success())
    }

    pub async fn do_add(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.add(op, controls).await;
        self.respond(OpKind::Add, started, outcome).await
    }

    async fn add(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let req = AddRequest::decode(op)?;
        let attributes = match &self.ctx.schema {
            Some(schema) => {
                let mut canonical = Attributes::new();
                for (name, values) in req.attributes {
                    let name = schema.find_attribute_type(&name)?.name().to_string();
                    if canonical.contains_key(&name) {
                        return Err(LdapError::new(ResultCode::AttributeOrValueExists, name).into());
                    }
                    canonical.insert(name, values);
                }
                canonical
            }
            None => req.attributes,
        };
        self.ctx
            .backend
            .add(&self.request_context(), &req.entry, &attributes)
            .await?;
        Ok(LdapResult::success())
    }

    pub async fn do_del(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.delete(op, controls).await;
        self.respond(OpKind::Delete, started, outcome).await
    }

    async fn delete(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let dn = decode_del_request(op)?;
        self.ctx.backend.delete(&self.request_context(), &dn).await?;
        Ok(LdapResult::success())
    }

    pub async fn do_modifydn(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.modify_dn(op, controls).await;
        self.respond(OpKind::ModifyDn, started, outcome).await
    }

    async fn modify_dn(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let req = ModifyDnRequest::decode(op)?;
        self.ctx
            .backend
            .modify_dn(
                &self.request_context(),
                &req.entry,
                &req.new_rdn,
                req.delete_old_rdn,
                req.new_superior.as_deref(),
            )
            .await?;
        Ok(LdapResult::success())
    }

    pub async fn do_compare(&self, op: &BerElement, controls: &[Control]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.compare(op, controls).await;
        self.respond(OpKind::Compare, started, outcome).await
    }

    async fn compare(&self, op: &BerElement, controls: &[Control]) -> Result<LdapResult> {
        reject_critical(controls)?;
        let req = CompareRequest::decode(op)?;
        let attr = match &self.ctx.schema {
            Some(schema) => schema.find_attribute_type(&req.attr)?.name().to_string(),
            None => req.attr,
        };
        let matched = self
            .ctx
            .backend
            .compare(&self.request_context(), &req.entry, &attr, &req.value)
            .await?;
        let code = if matched {
            ResultCode::CompareTrue
        } else {
            ResultCode::CompareFalse
        };
        Ok(LdapResult::new(code, ""))
    }
}
