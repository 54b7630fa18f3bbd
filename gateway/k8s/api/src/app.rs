use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes an application that plugins are linked into.
///
/// An app owns the ingress that linked plugins contribute their paths to.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoApp",
    root = "App",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbms: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// The host that the app's ingress serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}
