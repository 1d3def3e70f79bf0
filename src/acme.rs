//! ACME certificate provisioning (HTTP-01)
//!
//! Keeps the certificate for the configured domain fresh under
//! `data_dir/certs/`: `<domain>.crt`, `<domain>.key`, plus the reusable
//! account credentials in `account.json` (0600). Challenges are published
//! into a shared map that the port-80 server answers from. The active rustls
//! config is swapped in place after a renewal, so TLS reloads without
//! restarting the listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Renew when fewer than this many days remain.
const RENEWAL_DAYS: i64 = 30;

const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Polling bounds while an order progresses.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Currently active TLS server configuration, swappable after renewal.
pub struct TlsMaterial {
    config: RwLock<Arc<rustls::ServerConfig>>,
}

impl TlsMaterial {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn current(&self) -> Arc<rustls::ServerConfig> {
        self.config.read().clone()
    }

    pub fn replace(&self, config: Arc<rustls::ServerConfig>) {
        *self.config.write() = config;
    }
}

/// ACME client state for a single domain.
pub struct AcmeService {
    domain: String,
    email: String,
    certs_dir: PathBuf,
    /// token -> key authorization, served by the HTTP-01 handler
    challenges: DashMap<String, String>,
}

impl AcmeService {
    pub fn new(domain: &str, email: &str, data_dir: &Path) -> anyhow::Result<Self> {
        let certs_dir = data_dir.join("certs");
        std::fs::create_dir_all(&certs_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&certs_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            domain: domain.to_string(),
            email: email.to_string(),
            certs_dir,
            challenges: DashMap::new(),
        })
    }

    fn cert_path(&self) -> PathBuf {
        self.certs_dir.join(format!("{}.crt", self.domain))
    }

    fn key_path(&self) -> PathBuf {
        self.certs_dir.join(format!("{}.key", self.domain))
    }

    fn account_path(&self) -> PathBuf {
        self.certs_dir.join("account.json")
    }

    /// Response for a pending HTTP-01 challenge token, if any.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|v| v.clone())
    }

    /// Make sure a usable certificate exists on disk, ordering a new one if
    /// missing or close to expiry.
    pub async fn ensure_certificate(&self) -> anyhow::Result<()> {
        if self.cert_path().exists() {
            match read_certificate_expiry(&self.cert_path()) {
                Ok(days) if days >= RENEWAL_DAYS => {
                    debug!(
                        "certificate for {} valid for {} more days",
                        self.domain, days
                    );
                    return Ok(());
                }
                Ok(days) => info!(
                    "certificate for {} expires in {} days, renewing",
                    self.domain, days
                ),
                Err(e) => warn!(
                    "could not read certificate expiry for {}: {}",
                    self.domain, e
                ),
            }
        } else {
            info!("no certificate for {}, requesting one", self.domain);
        }
        self.request_certificate().await
    }

    /// Build a rustls server config from the cached PEM files.
    pub fn load_server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        load_server_config_from(&self.cert_path(), &self.key_path())
    }

    /// Periodic renewal check; swaps the active TLS config after a renewal.
    pub async fn run_renewal(
        self: Arc<Self>,
        tls: Arc<TlsMaterial>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
        ticker.tick().await; // the startup path already ensured a certificate
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.ensure_certificate().await {
                Ok(()) => match self.load_server_config() {
                    Ok(config) => tls.replace(config),
                    Err(e) => error!("failed to reload TLS material: {}", e),
                },
                Err(e) => error!("certificate renewal failed: {}", e),
            }
        }
    }

    /// Order a certificate via HTTP-01 and write it to the cache.
    async fn request_certificate(&self) -> anyhow::Result<()> {
        let account = self.get_or_create_account().await?;

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(self.domain.clone())],
            })
            .await
            .context("failed to create ACME order")?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => anyhow::bail!("unexpected authorization status: {status:?}"),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("no HTTP-01 challenge for {}", self.domain))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            info!(
                "HTTP-01 challenge ready at /.well-known/acme-challenge/{}",
                challenge.token
            );

            order.set_challenge_ready(&challenge.url).await?;

            let outcome = self.wait_for_authorization(&mut order).await;
            self.challenges.remove(&challenge.token);
            outcome?;
        }

        // Wait until the order accepts a CSR
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => anyhow::bail!("order became invalid"),
                _ => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("order pending timeout for {}", self.domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(vec![self.domain.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain = loop {
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("no certificate returned for {}", self.domain);
                }
                OrderStatus::Invalid => anyhow::bail!("order became invalid after finalization"),
                _ => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("certificate issuance timeout for {}", self.domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        };

        std::fs::write(self.cert_path(), &cert_chain)?;
        std::fs::write(self.key_path(), key_pair.serialize_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(self.key_path(), std::fs::Permissions::from_mode(0o600))?;
        }
        info!("certificate for {} issued and cached", self.domain);
        Ok(())
    }

    async fn wait_for_authorization(
        &self,
        order: &mut instant_acme::Order,
    ) -> anyhow::Result<()> {
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;
            let authorizations = order.authorizations().await?;
            match authorizations.first().map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!("challenge validated for {}", self.domain);
                    return Ok(());
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("challenge validation failed for {}", self.domain);
                }
                _ => {}
            }
        }
        anyhow::bail!("challenge validation timeout for {}", self.domain)
    }

    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        if let Ok(data) = std::fs::read_to_string(self.account_path()) {
            if let Ok(credentials) = serde_json::from_str::<AccountCredentials>(&data) {
                debug!("reusing ACME account from {:?}", self.account_path());
                return Ok(Account::from_credentials(credentials).await?);
            }
            warn!("stored ACME account unreadable, creating a new one");
        }

        let contact: Vec<String> = if self.email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{}", self.email)]
        };
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            DIRECTORY_URL,
            None,
        )
        .await
        .context("failed to create ACME account")?;

        let json = serde_json::to_string_pretty(&credentials)?;
        std::fs::write(self.account_path(), json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                self.account_path(),
                std::fs::Permissions::from_mode(0o600),
            )?;
        }
        info!("ACME account created");
        Ok(account)
    }
}

/// Days until the certificate in `path` expires.
fn read_certificate_expiry(path: &Path) -> anyhow::Result<i64> {
    let pem_data = std::fs::read(path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_data)
        .map_err(|e| anyhow::anyhow!("PEM parse error: {e}"))?;
    let cert = pem.parse_x509()?;
    let not_after = cert.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();
    Ok((not_after - now) / 86400)
}

/// Build a rustls server config (h2 + http/1.1 ALPN) from PEM files.
pub fn load_server_config_from(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open {}", cert_path.display()))?;
    let mut reader = std::io::BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open {}", key_path.display()))?;
    let mut reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
