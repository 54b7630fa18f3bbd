#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod app;
pub mod bundle;
pub mod duration;
pub mod link;
pub mod plugin;

pub use self::{
    app::{App, AppSpec},
    bundle::{Bundle, BundleDetails, BundleSpec, BundleTag},
    duration::GoDuration,
    link::{AppPluginLink, AppPluginLinkSpec},
    plugin::{Plugin, PluginSpec},
};
pub use k8s_openapi::{
    api::{
        self,
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    NamespaceResourceScope,
};
pub use kube::{
    api::{ObjectMeta, Resource, ResourceExt},
    Client, Error,
};

/// The API group of every custom resource served through the gateway.
pub const API_GROUP: &str = "entando.org";

/// Identifies objects that the gateway creates on behalf of its clients.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "plugin-gateway";

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn custom_resources_are_namespaced_in_the_api_group() {
        for crd in [
            App::crd(),
            Plugin::crd(),
            AppPluginLink::crd(),
            Bundle::crd(),
        ] {
            assert_eq!(crd.spec.group, API_GROUP);
            assert_eq!(crd.spec.scope, "Namespaced");
            assert_eq!(crd.spec.versions[0].name, "v1");
        }
        assert_eq!(App::kind(&()), "EntandoApp");
        assert_eq!(AppPluginLink::kind(&()), "EntandoAppPluginLink");
    }
}
