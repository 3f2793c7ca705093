use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use url::Url;

use crate::auth::jwt::JwksSource;

/// Command line front end, with every flag overridable through the
/// `PROM_PROXY_*` environment.
#[derive(Debug, Parser)]
#[command(name = "prometheus-tenant-proxy", version, about = "Makes your Prometheus server multi-tenant")]
pub struct Cli {
    /// Port to expose this Prometheus proxy
    #[arg(long, env = "PROM_PROXY_PORT", default_value_t = 9092)]
    pub port: u16,

    /// Prometheus server endpoint (may include a path prefix)
    #[arg(long, env = "PROM_PROXY_ENDPOINT", default_value = "http://localhost:9091")]
    pub prometheus_endpoint: String,

    /// Endpoints served without authentication (mostly live/readiness probes)
    #[arg(
        long,
        env = "PROM_PROXY_UNPROTECTED_ENDPOINTS",
        default_value = "/-/healthy,/-/ready",
        value_delimiter = ','
    )]
    pub unprotected_endpoints: Vec<String>,

    /// Auth mechanism
    #[arg(long, env = "PROM_PROXY_AUTH_TYPE", value_enum, default_value = "basic")]
    pub auth_type: AuthKind,

    /// AuthN YAML file path (basic auth), or JWKS file path or URL (jwt auth)
    #[arg(long, env = "PROM_PROXY_AUTH_CONFIG", default_value = "authn.yaml")]
    pub auth_config: String,

    /// Interval between credential reloads, in minutes; 0 disables reloading
    #[arg(long, env = "PROM_PROXY_RELOAD_INTERVAL", default_value_t = 5)]
    pub reload_interval: u64,

    /// Sign outbound requests with AWS SigV4 (Amazon Managed Prometheus)
    #[arg(long = "aws", env = "PROM_PROXY_USE_AWS")]
    pub aws: bool,

    /// Restrict the protected handler to paths ending in one of these suffixes.
    /// Unset means no restriction; set but empty denies every path.
    #[arg(long, env = "PROM_PROXY_ALLOWED_PATHS", value_delimiter = ',', num_args = 0..)]
    pub allowed_paths: Option<Vec<String>>,

    /// Log filtering directives (tracing `EnvFilter` syntax)
    #[arg(long, env = "PROM_PROXY_LOG")]
    pub log_directives: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthKind {
    Basic,
    Jwt,
}

/// Validated process-wide configuration, immutable after start.
#[derive(Debug, Clone)]
pub struct Conf {
    pub port: u16,
    pub upstream: Url,
    pub unprotected_endpoints: Vec<String>,
    pub auth: AuthConf,
    pub reload_interval: Option<Duration>,
    pub aws: bool,
    pub allowed_paths: Option<Vec<String>>,
    pub log_directives: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AuthConf {
    Basic { users_file: Utf8PathBuf },
    Jwt { source: JwksSource },
}

impl Conf {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let upstream = Url::parse(&cli.prometheus_endpoint)
            .with_context(|| format!("invalid prometheus endpoint: {}", cli.prometheus_endpoint))?;

        anyhow::ensure!(
            matches!(upstream.scheme(), "http" | "https"),
            "unsupported prometheus endpoint scheme: {}",
            upstream.scheme()
        );

        let mut unprotected_endpoints = Vec::new();

        for endpoint in cli.unprotected_endpoints {
            let endpoint = endpoint.trim();

            if endpoint.is_empty() {
                continue;
            }

            anyhow::ensure!(
                endpoint.starts_with('/'),
                "unprotected endpoint must be an absolute path: {endpoint}"
            );

            if !unprotected_endpoints.iter().any(|known| known == endpoint) {
                unprotected_endpoints.push(endpoint.to_owned());
            }
        }

        let auth = match cli.auth_type {
            AuthKind::Basic => AuthConf::Basic {
                users_file: Utf8PathBuf::from(cli.auth_config),
            },
            AuthKind::Jwt => AuthConf::Jwt {
                source: JwksSource::parse(&cli.auth_config)
                    .with_context(|| format!("invalid JWKS source: {}", cli.auth_config))?,
            },
        };

        let reload_interval = match cli.reload_interval {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };

        // An empty suffix would match every path, which turns an intended
        // deny-all allow-list into allow-all.
        let allowed_paths = cli
            .allowed_paths
            .map(|paths| paths.into_iter().filter(|path| !path.is_empty()).collect());

        Ok(Conf {
            port: cli.port,
            upstream,
            unprotected_endpoints,
            auth,
            reload_interval,
            aws: cli.aws,
            allowed_paths,
            log_directives: cli.log_directives,
        })
    }
}
