use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Which driver a descriptor talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// Relational.
    #[serde(rename = "postgres", alias = "postgresql")]
    Postgres,
    /// Document store.
    #[serde(rename = "mongodb", alias = "mongo")]
    MongoDb,
}

impl BackendKind {
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::Postgres => 5432,
            BackendKind::MongoDb => 27017,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => write!(f, "PostgreSQL"),
            BackendKind::MongoDb => write!(f, "MongoDB"),
        }
    }
}

/// Everything needed to reach one target database.
///
/// Built by the caller and treated as immutable for the length of an
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Relational namespace to introspect.
    #[serde(default = "default_schema")]
    pub schema: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Ignored for the verify modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate bundle (PEM format).
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Pre-built connection string, used verbatim when present.
    #[serde(default)]
    pub connection_uri: Option<String>,
    /// Build `mongodb+srv://` URIs instead of `mongodb://host:port`.
    #[serde(default)]
    pub srv: bool,
}

fn default_schema() -> String {
    String::from("public")
}

/// SSL/TLS connection modes, named after libpq's `sslmode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    fn as_libpq(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    fn is_strict(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl ConnectionDescriptor {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            host: String::from("localhost"),
            port: backend.default_port(),
            database: String::new(),
            schema: default_schema(),
            username: String::new(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            connection_uri: None,
            srv: false,
        }
    }

    /// libpq key/value string, or the explicit URI when one was supplied.
    pub fn postgres_connection_string(&self, settings: &Settings) -> String {
        if let Some(uri) = &self.connection_uri {
            return uri.clone();
        }
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            self.ssl_mode.as_libpq(),
            settings.connect_timeout().as_secs().max(1)
        )
    }

    pub fn mongo_uri(&self) -> String {
        if let Some(uri) = &self.connection_uri {
            return uri.clone();
        }

        let credentials = if self.username.is_empty() {
            String::new()
        } else {
            format!(
                "{}:{}@",
                percent_encode(&self.username),
                percent_encode(&self.password)
            )
        };
        let (scheme, host) = if self.srv {
            ("mongodb+srv", self.host.clone())
        } else {
            ("mongodb", format!("{}:{}", self.host, self.port))
        };

        let mut params = Vec::new();
        if self.ssl_mode != SslMode::Disable && !self.srv {
            params.push("tls=true");
            if self.accept_invalid_certs && !self.ssl_mode.is_strict() {
                params.push("tlsAllowInvalidCertificates=true");
            }
        }
        params.push("retryWrites=true");
        params.push("w=majority");

        format!(
            "{}://{}{}/{}?{}",
            scheme,
            credentials,
            host,
            self.database,
            params.join("&")
        )
    }

    /// Database to select on a MongoDB server: the URI's path segment when
    /// an explicit URI carries one, otherwise the stored name.
    pub fn mongo_database_name(&self) -> String {
        self.connection_uri
            .as_deref()
            .and_then(database_from_uri)
            .unwrap_or_else(|| self.database.clone())
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

fn database_from_uri(uri: &str) -> Option<String> {
    let (_, rest) = uri.split_once("://")?;
    let (_, path) = rest.split_once('/')?;
    let name = path.split('?').next().unwrap_or_default().trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Percent-encode URI userinfo (RFC 3986 unreserved characters pass).
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum PgTls {
    Plain,
    Native(MakeTlsConnector),
}

/// Per-operation PostgreSQL pool.
///
/// Connections go back to the pool when their `Object` is dropped and are
/// closed when the pool itself is dropped at the end of the operation.
pub struct PgPool {
    pool: Pool,
    tls: PgTls,
    settings: Settings,
}

impl PgPool {
    /// Build the pool and ping the server once.
    pub async fn connect(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<Self> {
        let conn_string = descriptor.postgres_connection_string(settings);
        let mut pg_config: tokio_postgres::Config = conn_string
            .parse()
            .map_err(|e| Error::connection(BackendKind::Postgres, e))?;
        pg_config.connect_timeout(settings.connect_timeout());

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let tls = if descriptor.ssl_mode == SslMode::Disable {
            PgTls::Plain
        } else {
            PgTls::Native(build_tls_connector(descriptor)?)
        };
        let manager = match &tls {
            PgTls::Plain => Manager::from_config(pg_config, NoTls, manager_config),
            PgTls::Native(connector) => {
                Manager::from_config(pg_config, connector.clone(), manager_config)
            }
        };
        let pool = Pool::builder(manager)
            .max_size(settings.introspection_concurrency.max(1))
            .build()
            .map_err(|e| Error::connection(BackendKind::Postgres, e))?;

        let pg = Self {
            pool,
            tls,
            settings: settings.clone(),
        };
        let client = pg.get().await?;
        tokio::time::timeout(settings.connect_timeout(), client.simple_query("SELECT 1"))
            .await
            .map_err(|_| Error::connection(BackendKind::Postgres, "ping timed out"))?
            .map_err(|e| Error::connection(BackendKind::Postgres, e))?;
        debug!(host = %descriptor.host, database = %descriptor.database, "postgres connection ready");
        Ok(pg)
    }

    pub async fn get(&self) -> Result<Object> {
        let timeout = self.settings.connect_timeout();
        tokio::time::timeout(timeout, self.pool.get())
            .await
            .map_err(|_| {
                Error::connection(
                    BackendKind::Postgres,
                    format!("connection timed out after {}s", timeout.as_secs()),
                )
            })?
            .map_err(|e| Error::connection(BackendKind::Postgres, e))
    }

    /// Ask the server to abandon whatever `client` is running.
    pub async fn cancel(&self, client: &Object) {
        let token = client.cancel_token();
        let result = match &self.tls {
            PgTls::Plain => token.cancel_query(NoTls).await,
            PgTls::Native(connector) => token.cancel_query(connector.clone()).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to cancel running query");
        }
    }
}

/// Build a TLS connector with appropriate certificate configuration.
fn build_tls_connector(descriptor: &ConnectionDescriptor) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if descriptor.accept_invalid_certs && !descriptor.ssl_mode.is_strict() {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &descriptor.ca_cert_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            Error::connection(
                BackendKind::Postgres,
                format!("failed to read CA certificate file {}: {}", ca_path, e),
            )
        })?;
        for cert in parse_pem_bundle(&pem)? {
            builder.add_root_certificate(cert);
        }
    }
    if descriptor.ssl_mode == SslMode::VerifyCa {
        builder.danger_accept_invalid_hostnames(true);
    }

    let connector = builder
        .build()
        .map_err(|e| Error::connection(BackendKind::Postgres, e))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificates.
///
/// `Certificate::from_pem` only reads the first block, so each block is
/// handed to it separately.
fn parse_pem_bundle(pem: &[u8]) -> Result<Vec<native_tls::Certificate>> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let text = std::str::from_utf8(pem).map_err(|_| {
        Error::connection(BackendKind::Postgres, "CA certificate file is not valid UTF-8")
    })?;

    let mut certs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(BEGIN) {
        let Some(len) = rest[start..].find(END) else {
            break;
        };
        let block = &rest[start..start + len + END.len()];
        let cert = native_tls::Certificate::from_pem(block.as_bytes())
            .map_err(|e| Error::connection(BackendKind::Postgres, e))?;
        certs.push(cert);
        rest = &rest[start + len + END.len()..];
    }

    if certs.is_empty() {
        return Err(Error::connection(
            BackendKind::Postgres,
            "no valid certificates found in PEM data",
        ));
    }
    Ok(certs)
}

// ---------------------------------------------------------------------------
// MongoDB
// ---------------------------------------------------------------------------

/// One MongoDB client bound to the target database.
///
/// Call [`MongoSession::close`] when done; callers compute their result
/// first and close on every path.
pub struct MongoSession {
    client: mongodb::Client,
    pub database: mongodb::Database,
}

impl MongoSession {
    pub async fn open(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<Self> {
        let mut options = ClientOptions::parse(descriptor.mongo_uri())
            .await
            .map_err(|e| Error::connection(BackendKind::MongoDb, e))?;
        options.connect_timeout = Some(settings.connect_timeout());
        options.server_selection_timeout = Some(settings.connect_timeout());
        options.app_name = Some(String::from("askdb"));

        let client = mongodb::Client::with_options(options)
            .map_err(|e| Error::connection(BackendKind::MongoDb, e))?;

        let ping = tokio::time::timeout(
            settings.connect_timeout(),
            client.database("admin").run_command(doc! { "ping": 1 }, None),
        )
        .await;
        let failure = match ping {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(String::from("ping timed out")),
        };
        if let Some(message) = failure {
            client.shutdown().await;
            return Err(Error::connection(BackendKind::MongoDb, message));
        }

        let name = descriptor.mongo_database_name();
        debug!(database = %name, "mongodb connection ready");
        Ok(Self {
            database: client.database(&name),
            client,
        })
    }

    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

/// Connect and ping, releasing everything before returning.
pub async fn test_connection(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<()> {
    match descriptor.backend {
        BackendKind::Postgres => PgPool::connect(descriptor, settings).await.map(drop),
        BackendKind::MongoDb => {
            let session = MongoSession::open(descriptor, settings).await?;
            session.close().await;
            Ok(())
        }
    }
}
