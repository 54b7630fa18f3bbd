use crate::{App, Plugin};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Associates an app with a plugin.
///
/// A link names both endpoints; nothing keeps those endpoints alive after the
/// link is created, so either may since have been deleted.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoAppPluginLink",
    root = "AppPluginLink",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct AppPluginLinkSpec {
    pub entando_app_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entando_app_namespace: Option<String>,

    pub entando_plugin_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entando_plugin_namespace: Option<String>,
}

// === impl AppPluginLink ===

impl AppPluginLink {
    /// Builds the link between `app` and `plugin`, placed in the app's
    /// namespace.
    pub fn between(app: &App, plugin: &Plugin) -> Self {
        let app_name = app.name_any();
        let plugin_name = plugin.name_any();
        let mut link = Self::new(
            &format!("{app_name}-to-{plugin_name}-link"),
            AppPluginLinkSpec {
                entando_app_name: app_name,
                entando_app_namespace: app.namespace(),
                entando_plugin_name: plugin_name,
                entando_plugin_namespace: plugin.namespace(),
            },
        );
        link.metadata.namespace = app.namespace();
        link
    }

    /// Indicates whether this link's app endpoint is `app`.
    ///
    /// A link that does not record its app's namespace matches by name only.
    pub fn links_app(&self, app: &App) -> bool {
        self.spec.entando_app_name == app.name_any()
            && endpoint_namespace_matches(&self.spec.entando_app_namespace, app.namespace())
    }

    /// Indicates whether this link's plugin endpoint is `plugin`.
    pub fn links_plugin(&self, plugin: &Plugin) -> bool {
        self.spec.entando_plugin_name == plugin.name_any()
            && endpoint_namespace_matches(&self.spec.entando_plugin_namespace, plugin.namespace())
    }
}

fn endpoint_namespace_matches(recorded: &Option<String>, actual: Option<String>) -> bool {
    match (recorded, actual) {
        (Some(recorded), Some(actual)) => *recorded == actual,
        _ => true,
    }
}
