//! Per-node management API client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use reqwest::StatusCode;
use thiserror::Error;

use crate::lifecycle::RemoteStatus;
use cass_core::crd::{CassandraDatacenter, ManagementApiAuth, ManagementApiAuthManualConfig, RequiredMetadata};

/// The duration for which transport credentials built from a secret are reused.
const CREDENTIALS_TTL: Duration = Duration::from_secs(60);

const PATH_STATUS: &str = "/api/v0/ops/node/status";
const PATH_START: &str = "/api/v0/lifecycle/start";
const PATH_DECOMMISSION: &str = "/api/v0/ops/node/decommission";
const PATH_DRAIN: &str = "/api/v0/ops/node/drain";
const PATH_ROLE: &str = "/api/v0/ops/auth/role";

/// Errors from a node's management API.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// The endpoint could not be dialed, or the call timed out.
    #[error("management API of node {0} is unreachable: {1}")]
    Unreachable(String, String),
    /// The node is already in the state the call drives it to, such as a start of a running node.
    ///
    /// Answered with a 409. Callers treat it as success.
    #[error("node {0} is already running or in the requested state")]
    AlreadyRunning(String),
    /// The endpoint answered with a non-success status.
    #[error("management API of node {node} rejected the request with status {code}: {body}")]
    Rejected { node: String, code: u16, body: String },
    /// The endpoint answered with a body which could not be understood.
    #[error("invalid response from management API of node {0}: {1}")]
    InvalidResponse(String, String),
    /// Transport credentials for the endpoint could not be built.
    #[error("error building management API credentials: {0}")]
    Credentials(String),
}

/// The address of a node's management API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddr {
    pub pod: String,
    pub ip: String,
}

/// A superuser credential pair, as read from the superuser secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// The operations supported by a node's management API.
#[async_trait]
pub trait NodeManagement: Send + Sync {
    /// Fetch the status of the server process of a node.
    async fn status(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<RemoteStatus, MgmtError>;
    /// Start the server process of a node, optionally replacing the node formerly at `replace_ip`.
    async fn start(&self, dc: &CassandraDatacenter, node: &NodeAddr, replace_ip: Option<&str>) -> Result<(), MgmtError>;
    /// Decommission a node, streaming its data to the rest of the ring.
    async fn decommission(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError>;
    /// Drain a node, flushing memtables and refusing new writes.
    async fn drain(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError>;
    /// Create or update the superuser role.
    async fn upsert_superuser(&self, dc: &CassandraDatacenter, node: &NodeAddr, creds: &Credentials) -> Result<(), MgmtError>;
}

/// The transport credentials used to reach the management API of a datacenter's nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCredentials {
    /// Plain HTTP.
    Insecure,
    /// HTTPS with a client certificate.
    MutualTls {
        ca_pem: Option<Vec<u8>>,
        identity_pem: Vec<u8>,
    },
}

impl TransportCredentials {
    /// Build mutual TLS credentials from the client secret of a `manual` auth config.
    ///
    /// The secret is expected to hold `ca.crt`, `tls.crt` and `tls.key`. Unless validation is
    /// skipped, a missing entry is an error.
    pub fn from_manual_secret(config: &ManagementApiAuthManualConfig, secret: &Secret) -> Result<Self, MgmtError> {
        let get = |key: &str| -> Option<Vec<u8>> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|val| val.0.clone())
                .filter(|val| !val.is_empty())
        };
        let (ca, cert, key) = (get("ca.crt"), get("tls.crt"), get("tls.key"));
        if !config.skip_secret_validation {
            for (name, val) in [("ca.crt", &ca), ("tls.crt", &cert), ("tls.key", &key)] {
                if val.is_none() {
                    return Err(MgmtError::Credentials(format!(
                        "secret {} is missing the {} entry",
                        config.client_secret_name, name
                    )));
                }
            }
        }
        let mut identity_pem = cert.unwrap_or_default();
        identity_pem.push(b'\n');
        identity_pem.extend(key.unwrap_or_default());
        Ok(Self::MutualTls { ca_pem: ca, identity_pem })
    }

    /// The URL scheme used with these credentials.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Insecure => "http",
            Self::MutualTls { .. } => "https",
        }
    }

    /// Build an HTTP client using these credentials.
    pub fn build_client(&self, timeout: Duration) -> Result<reqwest::Client, MgmtError> {
        let builder = reqwest::Client::builder().timeout(timeout).use_rustls_tls();
        let builder = match self {
            Self::Insecure => builder,
            Self::MutualTls { ca_pem, identity_pem } => {
                let identity = reqwest::Identity::from_pem(identity_pem).map_err(|err| MgmtError::Credentials(err.to_string()))?;
                let mut builder = builder.identity(identity);
                if let Some(ca_pem) = ca_pem {
                    let ca = reqwest::Certificate::from_pem(ca_pem).map_err(|err| MgmtError::Credentials(err.to_string()))?;
                    builder = builder.add_root_certificate(ca);
                }
                builder
            }
        };
        builder.build().map_err(|err| MgmtError::Credentials(err.to_string()))
    }
}

/// A built HTTP client along with the moment it was built.
struct CachedClient {
    scheme: &'static str,
    client: reqwest::Client,
    built_at: Instant,
}

/// A management API client speaking HTTP to each node.
pub struct HttpManagementClient {
    kube: kube::Client,
    port: u16,
    timeout: Duration,
    /// Clients keyed by `{namespace}/{secret}`, or by the empty string for insecure access.
    clients: DashMap<String, CachedClient>,
}

impl HttpManagementClient {
    /// Create a new instance.
    pub fn new(kube: kube::Client, port: u16, timeout: Duration) -> Self {
        Self { kube, port, timeout, clients: DashMap::new() }
    }

    /// Get an HTTP client able to reach the nodes of the given datacenter.
    async fn client_for(&self, dc: &CassandraDatacenter) -> Result<(&'static str, reqwest::Client), MgmtError> {
        let strategy = dc
            .spec
            .management_api_auth
            .strategy()
            .map_err(|err| MgmtError::Credentials(err.to_string()))?;
        let key = match &strategy {
            ManagementApiAuth::Insecure => String::new(),
            ManagementApiAuth::Manual(manual) => format!("{}/{}", dc.namespace(), manual.client_secret_name),
        };
        if let Some(cached) = self.clients.get(&key) {
            if cached.built_at.elapsed() < CREDENTIALS_TTL || key.is_empty() {
                return Ok((cached.scheme, cached.client.clone()));
            }
        }

        let creds = match &strategy {
            ManagementApiAuth::Insecure => TransportCredentials::Insecure,
            ManagementApiAuth::Manual(manual) => {
                let api: Api<Secret> = Api::namespaced(self.kube.clone(), dc.namespace());
                let secret = tokio::time::timeout(self.timeout, api.get(&manual.client_secret_name))
                    .await
                    .map_err(|_| MgmtError::Credentials("timeout while fetching management API client secret".into()))?
                    .map_err(|err| MgmtError::Credentials(format!("error fetching management API client secret: {}", err)))?;
                TransportCredentials::from_manual_secret(manual, &secret)?
            }
        };
        let client = creds.build_client(self.timeout)?;
        let scheme = creds.scheme();
        self.clients.insert(
            key,
            CachedClient { scheme, client: client.clone(), built_at: Instant::now() },
        );
        Ok((scheme, client))
    }

    async fn post(&self, dc: &CassandraDatacenter, node: &NodeAddr, path: &str, query: &[(&str, &str)]) -> Result<StatusCode, MgmtError> {
        let (scheme, client) = self.client_for(dc).await?;
        let url = format!("{}://{}:{}{}", scheme, node.ip, self.port, path);
        tracing::info!(node = %node.pod, %url, "calling management API");
        let res = client
            .post(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| MgmtError::Unreachable(node.pod.clone(), err.to_string()))?;
        let code = res.status();
        if code.is_success() {
            return Ok(code);
        }
        let body = res.text().await.unwrap_or_default();
        if code == StatusCode::CONFLICT {
            return Err(MgmtError::AlreadyRunning(node.pod.clone()));
        }
        Err(MgmtError::Rejected { node: node.pod.clone(), code: code.as_u16(), body })
    }
}

#[async_trait]
impl NodeManagement for HttpManagementClient {
    #[tracing::instrument(level = "debug", skip(self, dc, node), fields(node = %node.pod))]
    async fn status(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<RemoteStatus, MgmtError> {
        let (scheme, client) = self.client_for(dc).await?;
        let url = format!("{}://{}:{}{}", scheme, node.ip, self.port, PATH_STATUS);
        let res = client
            .get(&url)
            .send()
            .await
            .map_err(|err| MgmtError::Unreachable(node.pod.clone(), err.to_string()))?;
        let code = res.status();
        if !code.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(MgmtError::Rejected { node: node.pod.clone(), code: code.as_u16(), body });
        }
        res.json::<RemoteStatus>()
            .await
            .map_err(|err| MgmtError::InvalidResponse(node.pod.clone(), err.to_string()))
    }

    async fn start(&self, dc: &CassandraDatacenter, node: &NodeAddr, replace_ip: Option<&str>) -> Result<(), MgmtError> {
        let query: Vec<(&str, &str)> = replace_ip.map(|ip| vec![("replace_ip", ip)]).unwrap_or_default();
        self.post(dc, node, PATH_START, &query).await.map(|_| ())
    }

    async fn decommission(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError> {
        self.post(dc, node, PATH_DECOMMISSION, &[]).await.map(|_| ())
    }

    async fn drain(&self, dc: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError> {
        self.post(dc, node, PATH_DRAIN, &[]).await.map(|_| ())
    }

    async fn upsert_superuser(&self, dc: &CassandraDatacenter, node: &NodeAddr, creds: &Credentials) -> Result<(), MgmtError> {
        let query = [
            ("username", creds.username.as_str()),
            ("password", creds.password.as_str()),
            ("is_superuser", "true"),
            ("can_login", "true"),
        ];
        self.post(dc, node, PATH_ROLE, &query).await.map(|_| ())
    }
}
