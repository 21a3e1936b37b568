//! One client socket: the read loop, the map of requests in flight, abandon,
//! the serialized response writer and the StartTLS upgrade.

use crate::backend::ResponseWriter;
use crate::ber::{read_frame, BerError};
use crate::ldap_protocol::{
    encode_notice_of_disconnection, encode_response, parse_ldap_message, Control, ExtendedRequest, LdapMessage, LdapResult,
    ProtocolOp, Response, START_TLS_OID,
};
use crate::operation::{result_response, Operation};
use crate::result::{Abandoned, LdapError, ResultCode};
use crate::server::{ClientStream, ServerContext};
use anyhow::{anyhow, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on every transport a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

struct InFlight {
    /// Distinguishes reuses of one message ID.
    seq: u64,
    token: CancellationToken,
}

struct WriterSlot<S> {
    /// `None` once closed, and while StartTLS has the stream reassembled.
    stream: Option<WriteHalf<ClientStream<S>>>,
    tls_active: bool,
}

/// State shared between the read loop and the operation tasks.
struct Session<S> {
    writer: Mutex<WriterSlot<S>>,
    in_flight: DashMap<i32, InFlight>,
    bind_dn: ArcSwapOption<String>,
    next_seq: AtomicU64,
}

impl<S: Transport> Session<S> {
    async fn write_locked(slot: &mut WriterSlot<S>, bytes: &[u8]) -> Result<()> {
        let stream = slot.stream.as_mut().ok_or_else(|| anyhow!("connection closed"))?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Write one whole message. With a token, nothing is written once it
    /// has been cancelled; abandon cancels under the same lock.
    async fn write_frame(&self, bytes: &[u8], token: Option<&CancellationToken>) -> Result<()> {
        let mut slot = self.writer.lock().await;
        if token.is_some_and(|t| t.is_cancelled()) {
            return Err(Abandoned.into());
        }
        Self::write_locked(&mut slot, bytes).await
    }

    async fn abandon(&self, target: i32) -> bool {
        let _slot = self.writer.lock().await;
        match self.in_flight.remove(&target) {
            Some((_, op)) => {
                op.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn abandon_all(&self) -> usize {
        let _slot = self.writer.lock().await;
        let ids: Vec<i32> = self.in_flight.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, op)) = self.in_flight.remove(&id) {
                op.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn close(&self) {
        let mut slot = self.writer.lock().await;
        if let Some(mut stream) = slot.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn identity(&self) -> Option<String> {
        self.bind_dn.load_full().map(|dn| dn.as_ref().clone())
    }
}

/// The writer handed to one operation: its responses stop the moment it
/// is abandoned.
struct OpWriter<S> {
    session: Arc<Session<S>>,
    token: CancellationToken,
}

#[async_trait]
impl<S: Transport> ResponseWriter for OpWriter<S> {
    async fn write_response(&self, message_id: i32, response: &Response) -> Result<()> {
        let bytes = encode_response(message_id, response);
        self.session.write_frame(&bytes, Some(&self.token)).await
    }
}

enum Flow {
    Continue,
    Close,
}

pub struct Connection<S = tokio::net::TcpStream> {
    ctx: Arc<ServerContext>,
    peer: String,
    session: Arc<Session<S>>,
    reader: Option<ReadHalf<ClientStream<S>>>,
    buffer: BytesMut,
}

impl<S: Transport> Connection<S> {
    pub fn new(stream: ClientStream<S>, peer: String, ctx: Arc<ServerContext>) -> Self {
        let tls_active = stream.is_tls();
        let (reader, writer) = tokio::io::split(stream);
        Self {
            ctx,
            peer,
            session: Arc::new(Session {
                writer: Mutex::new(WriterSlot {
                    stream: Some(writer),
                    tls_active,
                }),
                in_flight: DashMap::new(),
                bind_dn: ArcSwapOption::empty(),
                next_seq: AtomicU64::new(0),
            }),
            reader: Some(reader),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Serve the client until it unbinds, disconnects or breaks the protocol.
    pub async fn run(mut self) -> Result<()> {
        self.ctx.metrics.connection_opened();
        debug!("Handling client connection from {}", self.peer);
        let result = self.read_loop().await;
        let cancelled = self.session.abandon_all().await;
        if cancelled > 0 {
            debug!("Cancelled {} outstanding operations for {}", cancelled, self.peer);
        }
        self.session.close().await;
        self.ctx.metrics.connection_closed();
        debug!("Connection from {} closed", self.peer);
        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        let max_size = self.ctx.limits.max_message_size;
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(());
            };
            let frame = match read_frame(reader, &mut self.buffer, max_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Client {} disconnected", self.peer);
                    return Ok(());
                }
                Err(BerError::Io(e)) => {
                    debug!("Read from {} failed: {}", self.peer, e);
                    return Ok(());
                }
                Err(e) => {
                    self.disconnect(ResultCode::ProtocolError, &e.to_string()).await;
                    return Ok(());
                }
            };
            let message = match parse_ldap_message(&frame) {
                Ok(message) => message,
                Err(e) => {
                    self.disconnect(ResultCode::ProtocolError, &e.to_string()).await;
                    return Ok(());
                }
            };
            debug!(
                "{}: message {} {}",
                self.peer,
                message.message_id,
                message.protocol_op.name()
            );
            if let Flow::Close = self.handle(message).await? {
                return Ok(());
            }
        }
    }

    /// Send a notice of disconnection; the caller then drops the connection.
    async fn disconnect(&self, code: ResultCode, message: &str) {
        if code == ResultCode::ProtocolError {
            self.ctx.metrics.inc_protocol_error();
        }
        warn!("Disconnecting {}: {} ({})", self.peer, message, code);
        let notice = encode_notice_of_disconnection(code, message);
        if let Err(e) = self.session.write_frame(&notice, None).await {
            debug!("Could not send notice of disconnection to {}: {}", self.peer, e);
        }
    }

    async fn handle(&mut self, message: LdapMessage) -> Result<Flow> {
        let LdapMessage {
            message_id,
            protocol_op,
            controls,
        } = message;
        match protocol_op {
            ProtocolOp::BindRequest(body) => {
                let cancelled = self.session.abandon_all().await;
                if cancelled > 0 {
                    self.ctx.metrics.inc_abandoned();
                    debug!("Bind from {} cancelled {} operations", self.peer, cancelled);
                }
                let operation = self.operation(message_id, CancellationToken::new());
                match operation.do_bind(&body, &controls).await {
                    Ok(identity) => {
                        self.session.bind_dn.store(identity.map(Arc::new));
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        error!("Bind (message {}) from {} failed: {:#}", message_id, self.peer, e);
                        self.disconnect(ResultCode::OperationsError, "bind failed").await;
                        Ok(Flow::Close)
                    }
                }
            }
            ProtocolOp::UnbindRequest => {
                debug!("Unbind from {}", self.peer);
                Ok(Flow::Close)
            }
            ProtocolOp::AbandonRequest(target) => {
                if self.session.abandon(target).await {
                    self.ctx.metrics.inc_abandoned();
                    debug!("{} abandoned message {}", self.peer, target);
                } else {
                    debug!("{}: abandon of message {} ignored, not in flight", self.peer, target);
                }
                Ok(Flow::Continue)
            }
            ProtocolOp::ExtendedRequest(ExtendedRequest { name, .. }) if name == START_TLS_OID => {
                self.start_tls(message_id).await
            }
            ProtocolOp::ExtendedRequest(ExtendedRequest { name, .. }) => {
                self.disconnect(
                    ResultCode::ProtocolError,
                    &format!("unsupported extended operation {}", name),
                )
                .await;
                Ok(Flow::Close)
            }
            ProtocolOp::Unrecognized(tag) => {
                self.disconnect(
                    ResultCode::ProtocolError,
                    &format!("unrecognised protocol operation [APPLICATION {}]", tag),
                )
                .await;
                Ok(Flow::Close)
            }
            op => {
                self.spawn_operation(message_id, op, controls);
                Ok(Flow::Continue)
            }
        }
    }

    fn operation(&self, message_id: i32, token: CancellationToken) -> Operation {
        let writer: Arc<dyn ResponseWriter> = Arc::new(OpWriter {
            session: Arc::clone(&self.session),
            token: token.clone(),
        });
        Operation::new(
            Arc::clone(&self.ctx),
            writer,
            message_id,
            self.session.identity(),
            token,
        )
    }

    /// Register the request as in flight, then run it on its own task so the
    /// read loop carries on.
    fn spawn_operation(&self, message_id: i32, op: ProtocolOp, controls: Vec<Control>) {
        let token = CancellationToken::new();
        let seq = self.session.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self.session.in_flight.insert(
            message_id,
            InFlight {
                seq,
                token: token.clone(),
            },
        );
        if previous.is_some() {
            warn!("{} reused message id {} while it is in flight", self.peer, message_id);
        }

        let kind = op.kind();
        let operation = self.operation(message_id, token.clone());
        let session = Arc::clone(&self.session);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(async move { operation.dispatch(op, &controls).await });
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{}: response to message {} not written: {:#}", peer, message_id, e),
                Err(e) if e.is_panic() => {
                    error!("{}: {} (message {}) panicked", peer, kind.name(), message_id);
                    let result = LdapResult::new(ResultCode::OperationsError, "internal error");
                    if let Some(response) = result_response(kind, result) {
                        let bytes = encode_response(message_id, &response);
                        let _ = session.write_frame(&bytes, Some(&token)).await;
                    }
                }
                Err(_) => {}
            }
            session.in_flight.remove_if(&message_id, |_, op| op.seq == seq);
        });
    }

    /// In-band TLS upgrade. The success response goes out in cleartext, then
    /// the stream is reassembled and handed to the TLS acceptor.
    async fn start_tls(&mut self, message_id: i32) -> Result<Flow> {
        let session = Arc::clone(&self.session);
        let mut slot = session.writer.lock().await;
        let acceptor = self.ctx.start_tls_acceptor().cloned();
        let refusal = if slot.tls_active {
            Some(LdapError::operations("TLS already established"))
        } else if !session.in_flight.is_empty() {
            Some(LdapError::operations("operations in progress"))
        } else if acceptor.is_none() {
            Some(LdapError::unwilling("StartTLS not configured"))
        } else {
            None
        };
        let result = refusal.as_ref().map_or_else(LdapResult::success, LdapResult::from);
        let response = Response::Extended {
            result,
            name: Some(START_TLS_OID.to_string()),
            value: None,
        };
        Session::write_locked(&mut slot, &encode_response(message_id, &response)).await?;
        let Some(acceptor) = acceptor.filter(|_| refusal.is_none()) else {
            return Ok(Flow::Continue);
        };

        if !self.buffer.is_empty() {
            drop(slot);
            self.disconnect(ResultCode::ProtocolError, "data received after StartTLS request")
                .await;
            return Ok(Flow::Close);
        }
        let (Some(reader), Some(writer)) = (self.reader.take(), slot.stream.take()) else {
            return Ok(Flow::Close);
        };
        let ClientStream::Plain(plain) = reader.unsplit(writer) else {
            return Err(anyhow!("stream already wrapped in TLS"));
        };
        match acceptor.accept(plain).await {
            Ok(tls) => {
                let (reader, writer) = tokio::io::split(ClientStream::Tls(Box::new(tls)));
                self.reader = Some(reader);
                slot.stream = Some(writer);
                slot.tls_active = true;
                self.ctx.metrics.inc_start_tls();
                info!("StartTLS upgrade completed for {}", self.peer);
                Ok(Flow::Continue)
            }
            Err(e) => {
                error!("StartTLS handshake failed for {}: {}", self.peer, e);
                Ok(Flow::Close)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DerefAliases, RequestContext, SearchScope, SearchSink};
    use crate::config::LimitsConfig;
    use crate::entry::Attributes;
    use crate::filter::Filter;
    use crate::ldap_protocol::client::{self, Reply};
    use crate::ldap_protocol::{
        RawFilter, LDAP_TAG_BIND_RESPONSE, LDAP_TAG_COMPARE_RESPONSE, LDAP_TAG_DEL_RESPONSE,
        LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_TAG_SEARCH_RESULT_ENTRY,
        NOTICE_OF_DISCONNECTION_OID,
    };
    use crate::memory::MemoryBackend;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    /// Streams one entry, then waits until cancelled.
    struct Blocking;

    #[async_trait]
    impl Backend for Blocking {
        async fn search(
            &self,
            ctx: &RequestContext,
            _: &str,
            _: SearchScope,
            _: DerefAliases,
            _: &Filter,
            sink: &mut SearchSink,
        ) -> Result<()> {
            let mut entry = Attributes::new();
            entry.insert("cn".into(), vec!["first".into()]);
            sink.send_entry("cn=first", &entry).await?;
            ctx.token().cancelled().await;
            Err(Abandoned.into())
        }

        async fn delete(&self, _: &RequestContext, dn: &str) -> Result<()> {
            if dn == "cn=panic" {
                panic!("backend bug");
            }
            Ok(())
        }
    }

    struct Client {
        stream: DuplexStream,
        buffer: BytesMut,
    }

    impl Client {
        async fn send(&mut self, data: &[u8]) {
            self.stream.write_all(data).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Reply> {
            let frame = tokio::time::timeout(
                Duration::from_secs(5),
                read_frame(&mut self.stream, &mut self.buffer, 1 << 20),
            )
            .await
            .expect("no reply within 5s")
            .unwrap();
            frame.map(|f| client::decode_reply(&f))
        }
    }

    fn start_with(ctx: ServerContext) -> (Client, Arc<Session<DuplexStream>>, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(ClientStream::Plain(server), "test-peer".into(), Arc::new(ctx));
        let session = Arc::clone(&conn.session);
        let handle = tokio::spawn(conn.run());
        (
            Client {
                stream: client,
                buffer: BytesMut::new(),
            },
            session,
            handle,
        )
    }

    fn start(backend: impl Backend) -> (Client, Arc<Session<DuplexStream>>, JoinHandle<Result<()>>) {
        start_with(ServerContext::new(Arc::new(backend)))
    }

    fn present(attr: &str) -> RawFilter {
        RawFilter::Present(attr.into())
    }

    #[tokio::test]
    async fn test_bind_search_unbind() {
        let (mut c, session, handle) = start_with(
            ServerContext::new(Arc::new(MemoryBackend::new(None)))
                .with_naming_contexts(vec!["dc=example,dc=com".into()]),
        );
        c.send(&client::bind(1, 3, "", "")).await;
        let reply = c.recv().await.unwrap();
        assert_eq!((reply.message_id, reply.tag, reply.code), (1, LDAP_TAG_BIND_RESPONSE, Some(0)));
        assert_eq!(session.identity(), None);

        c.send(&client::search(2, "", SearchScope::BaseObject, 0, &present("objectClass"), &["namingContexts"]))
            .await;
        let entry = c.recv().await.unwrap();
        assert_eq!(entry.tag, LDAP_TAG_SEARCH_RESULT_ENTRY);
        assert_eq!(entry.dn.as_deref(), Some(""));
        assert_eq!(
            entry.attributes,
            vec![("namingContexts".to_string(), vec!["dc=example,dc=com".to_string()])]
        );
        let done = c.recv().await.unwrap();
        assert_eq!((done.message_id, done.tag, done.code), (2, LDAP_TAG_SEARCH_RESULT_DONE, Some(0)));

        c.send(&client::unbind(3)).await;
        assert!(c.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_records_identity() {
        let backend = MemoryBackend::new(None)
            .with_root("cn=admin,dc=example,dc=com", "secret")
            .unwrap();
        let (mut c, session, _handle) = start(backend);
        c.send(&client::bind(1, 3, "cn=admin,dc=example,dc=com", "secret")).await;
        assert_eq!(c.recv().await.unwrap().code, Some(0));
        assert_eq!(session.identity().as_deref(), Some("cn=admin,dc=example,dc=com"));

        c.send(&client::bind(2, 3, "cn=admin,dc=example,dc=com", "nope")).await;
        assert_eq!(c.recv().await.unwrap().code, Some(ResultCode::InvalidCredentials.code()));
        assert_eq!(session.identity(), None);
    }

    #[tokio::test]
    async fn test_abandon_stops_search() {
        let (mut c, session, _handle) = start(Blocking);
        c.send(&client::search(2, "dc=x", SearchScope::WholeSubtree, 0, &present("cn"), &[])).await;
        let first = c.recv().await.unwrap();
        assert_eq!((first.message_id, first.tag), (2, LDAP_TAG_SEARCH_RESULT_ENTRY));
        assert!(session.in_flight.contains_key(&2));

        c.send(&client::abandon(3, 2)).await;
        // abandon has no response; the next reply belongs to the next request
        c.send(&client::delete(4, "cn=x")).await;
        let reply = c.recv().await.unwrap();
        assert_eq!((reply.message_id, reply.tag, reply.code), (4, LDAP_TAG_DEL_RESPONSE, Some(0)));
        assert!(!session.in_flight.contains_key(&2));

        // abandoning something unknown is silent too
        c.send(&client::abandon(5, 99)).await;
        c.send(&client::delete(6, "cn=y")).await;
        assert_eq!(c.recv().await.unwrap().message_id, 6);
    }

    #[tokio::test]
    async fn test_slow_request_does_not_block_reads() {
        let (mut c, session, _handle) = start(Blocking);
        c.send(&client::search(2, "dc=x", SearchScope::WholeSubtree, 0, &present("cn"), &[])).await;
        c.send(&client::delete(3, "cn=x")).await;
        let mut seen = Vec::new();
        for _ in 0..2 {
            let r = c.recv().await.unwrap();
            seen.push((r.message_id, r.tag));
        }
        seen.sort();
        assert_eq!(seen, vec![(2, LDAP_TAG_SEARCH_RESULT_ENTRY), (3, LDAP_TAG_DEL_RESPONSE)]);
        assert!(session.in_flight.contains_key(&2));
    }

    #[tokio::test]
    async fn test_bind_cancels_in_flight() {
        let (mut c, session, _handle) = start(Blocking);
        c.send(&client::search(2, "dc=x", SearchScope::WholeSubtree, 0, &present("cn"), &[])).await;
        assert_eq!(c.recv().await.unwrap().tag, LDAP_TAG_SEARCH_RESULT_ENTRY);

        c.send(&client::bind(3, 3, "", "")).await;
        let reply = c.recv().await.unwrap();
        assert_eq!((reply.message_id, reply.tag), (3, LDAP_TAG_BIND_RESPONSE));
        assert!(session.in_flight.is_empty());

        c.send(&client::delete(4, "cn=x")).await;
        assert_eq!(c.recv().await.unwrap().message_id, 4);
    }

    #[tokio::test]
    async fn test_panicking_operation_answers_operations_error() {
        let (mut c, session, _handle) = start(Blocking);
        c.send(&client::delete(2, "cn=panic")).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(
            (reply.message_id, reply.tag, reply.code),
            (2, LDAP_TAG_DEL_RESPONSE, Some(ResultCode::OperationsError.code()))
        );
        c.send(&client::delete(3, "cn=fine")).await;
        assert_eq!(c.recv().await.unwrap().code, Some(0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_disconnects() {
        let (mut c, _session, handle) = start(MemoryBackend::new(None));
        // a SEQUENCE holding only an OCTET STRING
        c.send(&[0x30, 0x03, 0x04, 0x01, 0x41]).await;
        let notice = c.recv().await.unwrap();
        assert_eq!(notice.message_id, 0);
        assert_eq!(notice.tag, LDAP_TAG_EXTENDED_RESPONSE);
        assert_eq!(notice.code, Some(ResultCode::ProtocolError.code()));
        assert_eq!(notice.name.as_deref(), Some(NOTICE_OF_DISCONNECTION_OID));
        assert!(c.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_indefinite_length_disconnects() {
        let (mut c, _session, _handle) = start(MemoryBackend::new(None));
        c.send(&[0x30, 0x80, 0x02, 0x01, 0x01, 0x00, 0x00]).await;
        let notice = c.recv().await.unwrap();
        assert_eq!(notice.code, Some(ResultCode::ProtocolError.code()));
        assert!(c.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_message_disconnects() {
        let limits = LimitsConfig {
            max_message_size: 64,
            ..LimitsConfig::default()
        };
        let (mut c, _session, _handle) =
            start_with(ServerContext::new(Arc::new(MemoryBackend::new(None))).with_limits(limits));
        c.send(&client::compare(1, &"x".repeat(100), "cn", "y")).await;
        let notice = c.recv().await.unwrap();
        assert_eq!(notice.message_id, 0);
        assert_eq!(notice.code, Some(ResultCode::ProtocolError.code()));
    }

    #[tokio::test]
    async fn test_unknown_extended_operation_disconnects() {
        let (mut c, _session, _handle) = start(MemoryBackend::new(None));
        c.send(&client::extended(1, "1.3.6.1.4.1.4203.1.11.3")).await;
        let notice = c.recv().await.unwrap();
        assert_eq!(notice.name.as_deref(), Some(NOTICE_OF_DISCONNECTION_OID));
        assert_eq!(notice.code, Some(ResultCode::ProtocolError.code()));
        assert!(c.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_tls_not_configured() {
        let (mut c, _session, _handle) = start(MemoryBackend::new(None));
        c.send(&client::extended(1, START_TLS_OID)).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply.message_id, 1);
        assert_eq!(reply.tag, LDAP_TAG_EXTENDED_RESPONSE);
        assert_eq!(reply.code, Some(ResultCode::UnwillingToPerform.code()));
        assert_eq!(reply.name.as_deref(), Some(START_TLS_OID));

        // the connection carries on in cleartext
        c.send(&client::compare(2, "cn=x", "cn", "x")).await;
        let reply = c.recv().await.unwrap();
        assert_eq!((reply.message_id, reply.tag), (2, LDAP_TAG_COMPARE_RESPONSE));
        assert_eq!(reply.code, Some(ResultCode::NoSuchObject.code()));
    }

    #[tokio::test]
    async fn test_start_tls_with_operations_in_flight() {
        let (mut c, _session, _handle) = start(Blocking);
        c.send(&client::search(2, "dc=x", SearchScope::WholeSubtree, 0, &present("cn"), &[])).await;
        assert_eq!(c.recv().await.unwrap().tag, LDAP_TAG_SEARCH_RESULT_ENTRY);
        c.send(&client::extended(3, START_TLS_OID)).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply.message_id, 3);
        assert_eq!(reply.code, Some(ResultCode::OperationsError.code()));
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding() {
        let (mut c, session, handle) = start(Blocking);
        c.send(&client::search(2, "dc=x", SearchScope::WholeSubtree, 0, &present("cn"), &[])).await;
        assert_eq!(c.recv().await.unwrap().tag, LDAP_TAG_SEARCH_RESULT_ENTRY);
        drop(c);
        handle.await.unwrap().unwrap();
        assert!(session.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let (mut c, _session, _handle) = start(MemoryBackend::new(None));
        let data = client::bind(1, 3, "", "");
        let (head, tail) = data.split_at(3);
        c.send(head).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.send(tail).await;
        assert_eq!(c.recv().await.unwrap().code, Some(0));

        // two requests in one write
        let mut both = client::bind(2, 3, "", "");
        both.extend(client::bind(3, 3, "", ""));
        c.send(&both).await;
        assert_eq!(c.recv().await.unwrap().message_id, 2);
        assert_eq!(c.recv().await.unwrap().message_id, 3);

        let mut buf = [0u8; 1];
        assert!(tokio::time::timeout(Duration::from_millis(20), c.stream.read(&mut buf)).await.is_err());
    }
}
