pub mod backend;
pub mod ber;
pub mod config;
pub mod connection;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod ldap_protocol;
pub mod matching;
pub mod memory;
pub mod metrics;
pub mod operation;
pub mod result;
pub mod schema;
pub mod server;
pub mod syntax;
pub mod tls;

pub use backend::{Backend, RequestContext, ResponseWriter, SearchSink};
pub use config::Config;
pub use filter::{Filter, Truth};
pub use memory::MemoryBackend;
pub use metrics::{run_metrics_server, Metrics};
pub use result::{Abandoned, LdapError, ResultCode};
pub use schema::Schema;
pub use server::{Server, ServerContext};
