//! The per-identity gateway.
//!
//! [`Gateways`] resolves an identity token to a [`Gateway`]: the identity's
//! cached cluster client bound to the deployment's observed namespaces.
//! A [`Gateway`] exposes the app, plugin, link and bundle operations that
//! the REST layer serves.
//!
//! Operations that touch several resources are not transactional. Linking
//! a plugin creates the link before adding the plugin's path to the app's
//! ingress; if the ingress update fails, the link remains and the error is
//! returned so the caller can reconcile.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conventions;

pub use self::conventions::{
    app_ingress_key, plugin_ingress_key, plugin_target, PLUGIN_SERVICE_PORT,
};
use plugin_gateway_core::{
    ClientCache, Error, IngressCoalescer, IngressKey, ObservedNamespaces, ResourceApi, ResourceCollector,
    ResourceId, Result,
};
use plugin_gateway_k8s_api::{
    App, AppPluginLink, Bundle, Ingress, Plugin, Resource, ResourceExt,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// The cluster operations a [`Gateway`] needs.
pub trait Cluster:
    ResourceApi<App>
    + ResourceApi<Plugin>
    + ResourceApi<AppPluginLink>
    + ResourceApi<Bundle>
    + ResourceApi<Ingress>
    + Clone
    + 'static
{
}

impl<C> Cluster for C where
    C: ResourceApi<App>
        + ResourceApi<Plugin>
        + ResourceApi<AppPluginLink>
        + ResourceApi<Bundle>
        + ResourceApi<Ingress>
        + Clone
        + 'static
{
}

/// Resolves identities to gateways.
pub struct Gateways<C> {
    cache: Arc<ClientCache<C>>,
    namespaces: Arc<ObservedNamespaces>,
    max_attempts: usize,
}

/// One identity's view of the cluster.
pub struct Gateway<C> {
    namespaces: Arc<ObservedNamespaces>,
    apps: ResourceCollector<App, C>,
    plugins: ResourceCollector<Plugin, C>,
    links: ResourceCollector<AppPluginLink, C>,
    bundles: ResourceCollector<Bundle, C>,
    ingresses: IngressCoalescer<C>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeployMode {
    /// Fails if a plugin of the same name exists in any observed namespace.
    Create,
    CreateOrReplace,
}

// === impl Gateways ===

impl<C: Cluster> Gateways<C> {
    pub fn new(cache: Arc<ClientCache<C>>, namespaces: Arc<ObservedNamespaces>) -> Self {
        Self {
            cache,
            namespaces,
            max_attempts: plugin_gateway_core::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builds the gateway for `token`, reusing the token's cached client.
    pub fn for_identity(&self, token: &str) -> Result<Gateway<C>> {
        let client = self.cache.get(token)?;
        Ok(Gateway::new(
            client,
            self.namespaces.clone(),
            self.max_attempts,
        ))
    }

    pub fn namespaces(&self) -> &ObservedNamespaces {
        &self.namespaces
    }

    pub fn cache(&self) -> &Arc<ClientCache<C>> {
        &self.cache
    }
}

// === impl Gateway ===

impl<C: Cluster> Gateway<C> {
    pub fn new(client: C, namespaces: Arc<ObservedNamespaces>, max_attempts: usize) -> Self {
        Self {
            apps: ResourceCollector::new(client.clone(), namespaces.clone())
                .with_max_attempts(max_attempts),
            plugins: ResourceCollector::new(client.clone(), namespaces.clone())
                .with_max_attempts(max_attempts),
            links: ResourceCollector::new(client.clone(), namespaces.clone())
                .with_max_attempts(max_attempts),
            bundles: ResourceCollector::new(client.clone(), namespaces.clone()),
            ingresses: IngressCoalescer::new(client, namespaces.clone())
                .with_max_attempts(max_attempts),
            namespaces,
        }
    }

    pub fn namespaces(&self) -> &ObservedNamespaces {
        &self.namespaces
    }

    pub fn apps(&self) -> &ResourceCollector<App, C> {
        &self.apps
    }

    pub fn plugins(&self) -> &ResourceCollector<Plugin, C> {
        &self.plugins
    }

    pub fn links(&self) -> &ResourceCollector<AppPluginLink, C> {
        &self.links
    }

    /// Bundles are read-only.
    pub fn bundles(&self) -> &ResourceCollector<Bundle, C> {
        &self.bundles
    }

    pub fn ingresses(&self) -> &IngressCoalescer<C> {
        &self.ingresses
    }

    // === Apps ===

    pub async fn find_app(&self, name: &str) -> Result<App> {
        self.apps
            .find_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found(&App::kind(&()), None, name))
    }

    pub async fn app_ingress(&self, name: &str) -> Result<Ingress> {
        let app = self.find_app(name).await?;
        self.existing_ingress(&app_ingress_key(&app)).await
    }

    /// Links `plugin` into the named app.
    ///
    /// The plugin is reused if one of its name exists in any observed
    /// namespace and deployed otherwise. The link is created in the app's
    /// namespace, and then the plugin's path is added to the app's ingress.
    #[instrument(skip(self, plugin), fields(plugin = %plugin.name_any()))]
    pub async fn link_app_to_plugin(&self, app_name: &str, plugin: Plugin) -> Result<AppPluginLink> {
        let app = self.find_app(app_name).await?;
        let plugin = match self.plugins.find_by_name(&plugin.name_any()).await? {
            Some(existing) => existing,
            None => self.plugins.create(plugin).await?,
        };

        let link = self.links.create(AppPluginLink::between(&app, &plugin)).await?;
        info!(link = %link.name_any(), "Linked");

        // The link stays in place if this fails.
        self.ingresses
            .add_path(
                &app_ingress_key(&app),
                &plugin.spec.ingress_path,
                &plugin_target(&plugin),
            )
            .await?;
        Ok(link)
    }

    pub async fn app_links(&self, app_name: &str) -> Result<Vec<AppPluginLink>> {
        let app = self.find_app(app_name).await?;
        let links = self.links.list_all().await?;
        Ok(links.into_iter().filter(|l| l.links_app(&app)).collect())
    }

    // === Plugins ===

    /// Finds a plugin by name.
    ///
    /// A given namespace is searched first; if the plugin is not there, every
    /// observed namespace is searched.
    pub async fn find_plugin(&self, name: &str, namespace: Option<&str>) -> Result<Plugin> {
        if let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) {
            if let Some(plugin) = self.plugins.find_by_name_and_namespace(name, namespace).await? {
                return Ok(plugin);
            }
        }
        self.plugins
            .find_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found(&Plugin::kind(&()), None, name))
    }

    #[instrument(skip(self, plugin), fields(plugin = %plugin.name_any()))]
    pub async fn deploy_plugin(&self, plugin: Plugin, mode: DeployMode) -> Result<Plugin> {
        match mode {
            DeployMode::Create => {
                let name = plugin.name_any();
                if let Some(existing) = self.plugins.find_by_name(&name).await? {
                    return Err(Error::AlreadyExists {
                        kind: Plugin::kind(&()).to_string(),
                        id: ResourceId::new(existing.namespace().unwrap_or_default(), name),
                    });
                }
                self.plugins.create(plugin).await
            }
            DeployMode::CreateOrReplace => self.plugins.create_or_replace(plugin).await,
        }
    }

    pub async fn delete_plugin(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        let plugin = self.find_plugin(name, namespace).await?;
        let namespace = plugin.namespace().unwrap_or_default();
        self.plugins.delete(name, &namespace).await
    }

    pub async fn plugin_ingress(&self, name: &str, namespace: Option<&str>) -> Result<Ingress> {
        let plugin = self.find_plugin(name, namespace).await?;
        self.existing_ingress(&plugin_ingress_key(&plugin)).await
    }

    pub async fn plugin_links(&self, plugin: &Plugin) -> Result<Vec<AppPluginLink>> {
        let links = self.links.list_all().await?;
        Ok(links.into_iter().filter(|l| l.links_plugin(plugin)).collect())
    }

    /// Removes the plugin's path from the ingress of every app it is linked
    /// to. Each removal is an independent step; failures are reported
    /// together as [`Error::PartialFailure`] and completed removals stay.
    #[instrument(skip(self))]
    pub async fn remove_plugin_ingress_paths(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        let plugin = self.find_plugin(name, namespace).await?;
        let links = self.plugin_links(&plugin).await?;
        if links.is_empty() {
            return Ok(());
        }

        let apps = self.apps.list_all().await?;
        let mut paths = Vec::with_capacity(links.len());
        for link in &links {
            match apps.iter().find(|app| link.links_app(app)) {
                Some(app) => paths.push((app_ingress_key(app), plugin.spec.ingress_path.clone())),
                None => debug!(link = %link.name_any(), "Linked app no longer exists"),
            }
        }
        self.ingresses.remove_paths(paths).await
    }

    // === Links ===

    /// Deletes a link and removes its plugin's path from the app's ingress.
    ///
    /// Either endpoint may have been deleted since the link was created; the
    /// ingress is only touched when both still exist. An endpoint recorded
    /// in an unobserved namespace fails the call before the link is deleted.
    #[instrument(skip(self))]
    pub async fn unlink(&self, link_name: &str, namespace: Option<&str>) -> Result<()> {
        let link = match namespace.filter(|ns| !ns.is_empty()) {
            Some(namespace) => {
                self.links
                    .find_by_name_and_namespace(link_name, namespace)
                    .await?
            }
            None => self.links.find_by_name(link_name).await?,
        }
        .ok_or_else(|| Error::not_found(&AppPluginLink::kind(&()), namespace, link_name))?;

        // Resolve both endpoints before the link is deleted; an unobserved
        // endpoint must leave it in place.
        let link_namespace = link.namespace().unwrap_or_default();
        let app_namespace = link
            .spec
            .entando_app_namespace
            .clone()
            .unwrap_or_else(|| link_namespace.clone());
        let app = self
            .apps
            .find_by_name_and_namespace(&link.spec.entando_app_name, &app_namespace)
            .await?;
        let plugin = match link.spec.entando_plugin_namespace.as_deref() {
            Some(ns) => {
                self.plugins
                    .find_by_name_and_namespace(&link.spec.entando_plugin_name, ns)
                    .await?
            }
            None => self.plugins.find_by_name(&link.spec.entando_plugin_name).await?,
        };

        self.links.delete(link_name, &link_namespace).await?;

        match (app, plugin) {
            (Some(app), Some(plugin)) => {
                self.ingresses
                    .remove_path(&app_ingress_key(&app), &plugin.spec.ingress_path)
                    .await?;
            }
            _ => debug!("Linked app or plugin no longer exists; ingress left as is"),
        }
        Ok(())
    }

    async fn existing_ingress(&self, key: &IngressKey) -> Result<Ingress> {
        self.ingresses.get(key).await?.ok_or_else(|| {
            Error::not_found(&Ingress::kind(&()), Some(key.namespace.as_str()), &key.name)
        })
    }
}
