use crate::backend::Backend;
use crate::config::{Config, LimitsConfig, SchemaConfig};
use crate::connection::Connection;
use crate::entry::Attributes;
use crate::ldap_protocol::START_TLS_OID;
use crate::matching::Registries;
use crate::memory::MemoryBackend;
use crate::metrics::Metrics;
use crate::schema::Schema;
use crate::tls;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Client stream: plain or TLS-wrapped. Generic over the transport so the
/// connection can be driven over in-process pipes as well as TCP.
pub enum ClientStream<S = TcpStream> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> ClientStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClientStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Everything a connection needs from the server: the backend, the
/// optional schema, limits, TLS material and metrics. Read-only once the
/// listener starts, so it is shared between connections without locking.
pub struct ServerContext {
    pub backend: Arc<dyn Backend>,
    pub schema: Option<Arc<Schema>>,
    pub naming_contexts: Vec<String>,
    pub limits: LimitsConfig,
    pub metrics: Arc<Metrics>,
    tls: Option<TlsAcceptor>,
    start_tls: bool,
    root_dse: OnceLock<Attributes>,
}

impl ServerContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            schema: None,
            naming_contexts: Vec::new(),
            limits: LimitsConfig::default(),
            metrics: Arc::new(Metrics::new()),
            tls: None,
            start_tls: false,
            root_dse: OnceLock::new(),
        }
    }

    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_naming_contexts(mut self, naming_contexts: Vec<String>) -> Self {
        self.naming_contexts = naming_contexts;
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// TLS material for ldaps:// and, when `start_tls` is set, for the
    /// StartTLS extended operation.
    pub fn with_tls(mut self, acceptor: TlsAcceptor, start_tls: bool) -> Self {
        self.tls = Some(acceptor);
        self.start_tls = start_tls;
        self
    }

    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn start_tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref().filter(|_| self.start_tls)
    }

    /// Assemble the in-memory directory, schema and TLS material described by
    /// the configuration.
    pub async fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let schema = load_schema(&config.schema)?.map(Arc::new);
        let mut backend = MemoryBackend::new(schema.clone()).with_suffixes(&config.naming_contexts)?;
        if let (Some(dn), Some(password)) = (&config.directory.root_dn, &config.directory.root_password) {
            backend = backend.with_root(dn, password.clone())?;
        }
        backend
            .seed(config.directory.entries.iter().map(|e| (e.dn.clone(), e.attributes())))
            .await
            .context("Failed to load directory entries")?;
        info!("Directory loaded with {} entries", backend.len().await);

        let mut ctx = ServerContext::new(Arc::new(backend))
            .with_naming_contexts(config.naming_contexts.clone())
            .with_limits(config.limits.clone())
            .with_metrics(metrics);
        if let Some(schema) = schema {
            ctx = ctx.with_schema(schema);
        }
        if let Some(tls_config) = &config.tls {
            let acceptor = tls::build_acceptor(tls_config)?;
            info!("TLS enabled (StartTLS {})", if tls_config.start_tls { "offered" } else { "off" });
            ctx = ctx.with_tls(acceptor, tls_config.start_tls);
        }
        Ok(ctx)
    }

    /// The synthetic entry at the empty DN.
    pub fn root_dse(&self) -> &Attributes {
        self.root_dse.get_or_init(|| {
            let mut dse = Attributes::new();
            dse.insert(
                "objectClass".into(),
                vec!["top".into(), "OpenLDAProotDSE".into(), "extensibleObject".into()],
            );
            dse.insert("supportedLDAPVersion".into(), vec!["3".into()]);
            if !self.naming_contexts.is_empty() {
                dse.insert("namingContexts".into(), self.naming_contexts.clone());
            }
            if let Some(schema) = &self.schema {
                dse.insert("subschemaSubentry".into(), vec![schema.subschema_dn()]);
            }
            if self.start_tls_acceptor().is_some() {
                dse.insert("supportedExtension".into(), vec![START_TLS_OID.to_string()]);
            }
            dse
        })
    }
}

pub struct Server {
    listen_url: String,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub fn new(listen_url: String, ctx: Arc<ServerContext>) -> Self {
        Self { listen_url, ctx }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = parse_listen_url(&self.listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("LDAP server listening on {} ({})", addr, self.listen_url);
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections forever, one task per client.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let ldaps = if self.listen_url.starts_with("ldaps://") {
            Some(
                self.ctx
                    .tls_acceptor()
                    .cloned()
                    .context("ldaps:// listener requires TLS configuration")?,
            )
        } else {
            None
        };
        info!(
            "Schema: {}; naming contexts: {:?}",
            if self.ctx.schema.is_some() { "enabled" } else { "none" },
            self.ctx.naming_contexts
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let ctx = Arc::clone(&self.ctx);
                    let acceptor = ldaps.clone();

                    tokio::spawn(async move {
                        let client_stream = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => ClientStream::Plain(stream),
                        };
                        let connection = Connection::new(client_stream, peer_addr.to_string(), ctx);
                        if let Err(e) = connection.run().await {
                            error!("Error handling client {}: {:#}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Build the schema named by the configuration: the system schema first,
/// then each file in order. `None` runs the server schema-less.
pub fn load_schema(config: &SchemaConfig) -> Result<Option<Schema>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let mut schema = Schema::new(Arc::new(Registries::builtin()));
    if config.system {
        schema.load_system().context("Failed to load system schema")?;
    }
    for file in &config.files {
        schema
            .load_file(file)
            .with_context(|| format!("Failed to load schema file {}", file.display()))?;
    }
    schema.resolve_oids().context("Failed to resolve schema")?;
    info!(
        "Schema loaded: {} attribute types, {} object classes",
        schema.attribute_types().len(),
        schema.object_classes().len()
    );
    Ok(Some(schema))
}

pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    // Parse ldap://host:port or ldaps://host:port
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;

    let url = url.trim_start_matches('/').trim_end_matches('/');

    if url.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = url
            .trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}
