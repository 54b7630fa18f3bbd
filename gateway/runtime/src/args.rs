use crate::{
    cluster::{KubeCluster, MakeKubeClient},
    core::{ClientCache, ClientCacheMetrics, ObservedNamespaces},
    k8s::{self, Client, GoDuration, Resource},
    service::Gateways,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "plugin-gateway",
    about = "Namespace-scoped access to apps, plugins and their links"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "plugin_gateway=info,warn",
        env = "PLUGIN_GATEWAY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespaces that clients may reach, comma-separated.
    ///
    /// Nothing outside this list is ever read or written. An empty list
    /// reaches no namespace.
    #[clap(
        long,
        default_value = "",
        env = "PLUGIN_GATEWAY_OBSERVED_NAMESPACES"
    )]
    observed_namespaces: Namespaces,

    /// Namespace for created resources that name none. Defaults to the
    /// kubeconfig's namespace.
    #[clap(long, env = "POD_NAMESPACE")]
    default_namespace: Option<String>,

    /// How long an identity's client is reused before it is rebuilt.
    #[clap(long, default_value = "1h")]
    client_max_age: GoDuration,

    /// How often expired identity clients are evicted.
    #[clap(long, default_value = "1m")]
    client_scan_interval: GoDuration,

    #[clap(long, default_value = "30s")]
    client_read_timeout: GoDuration,

    /// Bounds the retries of ingress and upsert writes that lose a
    /// concurrent update.
    #[clap(long, default_value = "5")]
    ingress_max_attempts: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    fn validate(&self) -> Result<()> {
        if self.ingress_max_attempts == 0 {
            bail!("--ingress-max-attempts must be at least 1");
        }
        if self.client_scan_interval.as_duration().is_zero() {
            bail!("--client-scan-interval must be positive");
        }
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.validate()?;

        let Self {
            log_level,
            log_format,
            client,
            admin,
            observed_namespaces: Namespaces(observed_namespaces),
            default_namespace,
            client_max_age,
            client_scan_interval,
            client_read_timeout,
            ingress_max_attempts,
        } = self;

        let mut prom = <Registry>::default();
        let cache_metrics =
            ClientCacheMetrics::register(prom.sub_registry_with_prefix("client_cache"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        warn_unless_served::<k8s::App>(&runtime.client()).await;
        warn_unless_served::<k8s::Plugin>(&runtime.client()).await;
        warn_unless_served::<k8s::AppPluginLink>(&runtime.client()).await;
        warn_unless_served::<k8s::Bundle>(&runtime.client()).await;

        // Identity clients share the process's cluster endpoint and TLS
        // settings but never its credentials.
        let make_client = MakeKubeClient::infer(client_read_timeout.into()).await?;
        let default_namespace =
            default_namespace.unwrap_or_else(|| make_client.default_namespace().to_string());
        let namespaces = Arc::new(ObservedNamespaces::new(
            observed_namespaces,
            default_namespace,
        ));
        if namespaces.is_empty() {
            warn!("No observed namespaces are configured; every request will be rejected");
        }

        let cache: Arc<ClientCache<KubeCluster>> = Arc::new(
            ClientCache::new(make_client, client_max_age.into()).with_metrics(cache_metrics),
        );
        let sweep = cache.spawn_sweep(client_scan_interval.into());

        let gateways = Gateways::new(cache, namespaces.clone()).with_max_attempts(ingress_max_attempts);
        info!(
            observed = ?namespaces.iter().collect::<Vec<_>>(),
            default_namespace = %namespaces.default_namespace(),
            "Gateway ready"
        );

        // Cached clients are torn down once shutdown is signaled, before the
        // runtime finishes draining.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                let release = shutdown.signaled().await;
                drop(gateways);
                sweep.shutdown().await;
                drop(release);
            }
            .instrument(info_span!("gateway")),
        );

        // Serve the admin endpoints until the shutdown signal fires and the
        // cache has been torn down.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Namespaces(Vec<String>);

impl std::str::FromStr for Namespaces {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(ToString::to_string)
                .collect(),
        ))
    }
}

/// Logs a warning if the cluster does not serve the resource kind; requests
/// for it will fail until its definition is installed.
async fn warn_unless_served<T>(client: &Client)
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    let served = client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt));
    if !served {
        warn!(
            kind = %T::kind(&dt),
            api_version = %T::api_version(&dt),
            "Resource kind not found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["plugin-gateway"]).unwrap();
        assert!(args.observed_namespaces.0.is_empty());
        assert_eq!(args.client_max_age.as_duration().as_secs(), 3600);
        assert_eq!(args.client_scan_interval.as_duration().as_secs(), 60);
        assert_eq!(args.client_read_timeout.as_duration().as_secs(), 30);
        assert_eq!(args.ingress_max_attempts, 5);
    }

    #[test]
    fn parses_observed_namespaces() {
        let args = Args::try_parse_from([
            "plugin-gateway",
            "--observed-namespaces",
            "apps, plugins,,apps",
            "--client-max-age",
            "1h30m",
        ])
        .unwrap();
        assert_eq!(args.observed_namespaces.0, vec!["apps", "plugins", "apps"]);
        assert_eq!(args.client_max_age.as_duration().as_secs(), 5400);
    }

    #[test]
    fn rejects_zero_scan_interval() {
        let args = Args::try_parse_from(["plugin-gateway", "--client-scan-interval", "0"]).unwrap();
        assert!(args.validate().is_err());

        let args = Args::try_parse_from(["plugin-gateway", "--client-scan-interval", "5s"]).unwrap();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn rejects_zero_ingress_attempts() {
        let args = Args::try_parse_from(["plugin-gateway", "--ingress-max-attempts", "0"]).unwrap();
        assert!(args.validate().is_err());
    }
}
