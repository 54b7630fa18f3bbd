use plugin_gateway_core::{IngressKey, IngressTarget};
use plugin_gateway_k8s_api::{App, Plugin, ResourceExt};

/// The port every plugin's server service listens on.
pub const PLUGIN_SERVICE_PORT: i32 = 8081;

/// The ingress that serves `app` and the paths of its linked plugins.
pub fn app_ingress_key(app: &App) -> IngressKey {
    let name = app.name_any();
    let host = app
        .spec
        .ingress_host_name
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| name.clone());
    IngressKey::new(
        app.namespace().unwrap_or_default(),
        format!("{name}-ingress"),
        host,
    )
}

/// The plugin's own ingress.
pub fn plugin_ingress_key(plugin: &Plugin) -> IngressKey {
    let name = plugin.name_any();
    let host = plugin
        .spec
        .ingress_host_name
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| name.clone());
    IngressKey::new(
        plugin.namespace().unwrap_or_default(),
        format!("{name}-ingress"),
        host,
    )
}

pub fn plugin_target(plugin: &Plugin) -> IngressTarget {
    IngressTarget::new(
        format!("{}-server-service", plugin.name_any()),
        PLUGIN_SERVICE_PORT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_gateway_k8s_api::{AppSpec, PluginSpec};

    #[test]
    fn app_ingress_defaults_host_to_app_name() {
        let mut app = App::new("portal", AppSpec::default());
        app.metadata.namespace = Some("ns1".to_string());
        assert_eq!(
            app_ingress_key(&app),
            IngressKey::new("ns1", "portal-ingress", "portal")
        );

        app.spec.ingress_host_name = Some("portal.example.com".to_string());
        assert_eq!(app_ingress_key(&app).host, "portal.example.com");
    }

    #[test]
    fn plugin_routes_to_its_server_service() {
        let mut plugin = Plugin::new(
            "avatar",
            PluginSpec {
                ingress_path: "/avatar".to_string(),
                ingress_host_name: Some("plugins.example.com".to_string()),
                ..Default::default()
            },
        );
        plugin.metadata.namespace = Some("ns2".to_string());

        assert_eq!(
            plugin_ingress_key(&plugin),
            IngressKey::new("ns2", "avatar-ingress", "plugins.example.com")
        );
        assert_eq!(
            plugin_target(&plugin),
            IngressTarget::new("avatar-server-service", 8081)
        );
    }
}
