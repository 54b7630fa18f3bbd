use plugin_gateway_core::{Error, ObservedNamespaces, ResourceCollector};
use plugin_gateway_k8s_api::{Plugin, PluginSpec, ResourceExt};
use plugin_gateway_test_util::{FakeCluster, Verb};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn mk_plugin(namespace: Option<&str>, name: &str) -> Plugin {
    let mut plugin = Plugin::new(
        name,
        PluginSpec {
            image: Some(format!("registry.example.com/{name}:1.0.0")),
            ingress_path: format!("/{name}"),
            ..Default::default()
        },
    );
    plugin.metadata.namespace = namespace.map(ToString::to_string);
    plugin
}

fn mk_collector(
    cluster: &FakeCluster,
    observed: &[&str],
    default_namespace: &str,
) -> ResourceCollector<Plugin, FakeCluster> {
    let namespaces = Arc::new(ObservedNamespaces::new(observed, default_namespace));
    ResourceCollector::new(cluster.clone(), namespaces)
}

fn names(plugins: &[Plugin]) -> Vec<String> {
    plugins.iter().map(|p| p.name_any()).collect()
}

#[tokio::test]
async fn list_all_concatenates_observed_namespaces_in_order() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "a"));
    cluster.insert(mk_plugin(Some("ns1"), "b"));
    cluster.insert(mk_plugin(Some("ns2"), "c"));
    cluster.insert(mk_plugin(Some("unobserved"), "d"));
    let plugins = mk_collector(&cluster, &["ns2", "ns1"], "ns1");

    let all = plugins.list_all().await.unwrap();
    assert_eq!(names(&all), vec!["c", "a", "b"]);

    let mut concatenated = plugins.list_in_namespace("ns2").await.unwrap();
    concatenated.extend(plugins.list_in_namespace("ns1").await.unwrap());
    assert_eq!(all, concatenated);

    assert!(cluster.calls_in("unobserved").is_empty());
}

#[tokio::test]
async fn list_all_fails_when_any_namespace_fails() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "a"));
    cluster.fail_namespace("ns2");
    let plugins = mk_collector(&cluster, &["ns1", "ns2"], "ns1");

    let err = assert_err!(plugins.list_all().await);
    assert!(
        matches!(&err, Error::Transport { namespace, .. } if namespace == "ns2"),
        "unexpected error: {err}"
    );

    cluster.restore_namespace("ns2");
    assert_eq!(names(&plugins.list_all().await.unwrap()), vec!["a"]);
}

#[tokio::test]
async fn empty_observed_set_lists_nothing() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "a"));
    let plugins = mk_collector(&cluster, &[], "ns1");

    assert!(plugins.list_all().await.unwrap().is_empty());
    assert!(plugins.find_by_name("a").await.unwrap().is_none());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn unobserved_namespaces_are_rejected_without_cluster_calls() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("kube-system"), "a"));
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    let rejected = |result: Result<(), Error>| {
        assert!(
            matches!(&result, Err(Error::NotObservedNamespace { namespace }) if namespace == "kube-system"),
            "unexpected result: {result:?}"
        );
    };
    rejected(plugins.list_in_namespace("kube-system").await.map(drop));
    rejected(
        plugins
            .find_by_name_and_namespace("a", "kube-system")
            .await
            .map(drop),
    );
    rejected(
        plugins
            .create(mk_plugin(Some("kube-system"), "b"))
            .await
            .map(drop),
    );
    rejected(
        plugins
            .create_or_replace(mk_plugin(Some("kube-system"), "a"))
            .await
            .map(drop),
    );
    rejected(plugins.delete("a", "kube-system").await);

    assert_eq!(cluster.calls(), vec![]);
    assert!(cluster.object::<Plugin>("kube-system", "a").is_some());
}

#[tokio::test]
async fn find_by_name_returns_the_earliest_observed_match() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "avatar"));
    cluster.insert(mk_plugin(Some("ns2"), "avatar"));
    let plugins = mk_collector(&cluster, &["ns2", "ns1"], "ns1");

    let found = plugins.find_by_name("avatar").await.unwrap().unwrap();
    assert_eq!(found.namespace().as_deref(), Some("ns2"));
    assert!(plugins.find_by_name("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn find_by_name_and_namespace_reads_one_namespace() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "avatar"));
    let plugins = mk_collector(&cluster, &["ns1", "ns2"], "ns1");

    assert!(plugins
        .find_by_name_and_namespace("avatar", "ns1")
        .await
        .unwrap()
        .is_some());
    assert!(plugins
        .find_by_name_and_namespace("avatar", "ns2")
        .await
        .unwrap()
        .is_none());
    assert_eq!(cluster.count::<Plugin>(Verb::Get), 2);
    assert_eq!(cluster.count::<Plugin>(Verb::List), 0);
}

#[tokio::test]
async fn create_defaults_to_the_default_namespace() {
    let cluster = FakeCluster::new();
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    let created = plugins.create(mk_plugin(None, "p")).await.unwrap();
    assert_eq!(created.namespace().as_deref(), Some("ns1"));
    assert!(created.resource_version().is_some());

    let found = plugins.find_by_name("p").await.unwrap().unwrap();
    assert_eq!(found.namespace().as_deref(), Some("ns1"));
    assert_eq!(found.spec, created.spec);
}

#[tokio::test]
async fn create_rejects_an_unobserved_default_namespace() {
    let cluster = FakeCluster::new();
    let plugins = mk_collector(&cluster, &["ns1"], "default");

    let err = assert_err!(plugins.create(mk_plugin(None, "p")).await);
    assert!(matches!(err, Error::NotObservedNamespace { namespace } if namespace == "default"));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn create_rejects_duplicates() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "p"));
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    let err = assert_err!(plugins.create(mk_plugin(Some("ns1"), "p")).await);
    assert!(matches!(err, Error::AlreadyExists { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn create_or_replace_upserts() {
    let cluster = FakeCluster::new();
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    let created = assert_ok!(plugins.create_or_replace(mk_plugin(None, "p")).await);
    assert_eq!(created.spec.replicas, None);

    let mut update = mk_plugin(None, "p");
    update.spec.replicas = Some(3);
    let replaced = assert_ok!(plugins.create_or_replace(update).await);
    assert_eq!(replaced.spec.replicas, Some(3));
    assert_ne!(replaced.resource_version(), created.resource_version());
    assert_eq!(
        cluster
            .object::<Plugin>("ns1", "p")
            .and_then(|p| p.spec.replicas),
        Some(3)
    );
}

#[tokio::test]
async fn create_or_replace_retries_after_a_concurrent_write() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "p"));
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    // The first write is the create, which collides. Another writer then
    // bumps the version before the replace lands.
    cluster.before_next_write::<Plugin>(|c| {
        c.before_next_write::<Plugin>(|c| {
            c.update::<Plugin>("ns1", "p", |p| p.spec.dbms = Some("postgresql".into()))
        })
    });

    let mut update = mk_plugin(None, "p");
    update.spec.replicas = Some(2);
    let replaced = plugins.create_or_replace(update).await.unwrap();
    assert_eq!(replaced.spec.replicas, Some(2));
    assert_eq!(cluster.count::<Plugin>(Verb::Replace), 2);
}

fn keep_conflicting(cluster: &FakeCluster) {
    cluster.update::<Plugin>("ns1", "p", |p| {
        p.spec.replicas = Some(p.spec.replicas.unwrap_or(0) + 1)
    });
    cluster.before_next_write::<Plugin>(keep_conflicting);
}

#[tokio::test]
async fn create_or_replace_gives_up_after_bounded_attempts() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "p"));
    let plugins = mk_collector(&cluster, &["ns1"], "ns1").with_max_attempts(3);
    cluster.before_next_write::<Plugin>(keep_conflicting);

    let err = assert_err!(plugins.create_or_replace(mk_plugin(None, "p")).await);
    assert!(
        matches!(&err, Error::Conflict { attempts: 3, id, .. } if id.to_string() == "ns1/p"),
        "unexpected error: {err}"
    );
    assert_eq!(cluster.count::<Plugin>(Verb::Replace), 3);
}

#[tokio::test]
async fn delete_requires_an_existing_resource() {
    let cluster = FakeCluster::new();
    cluster.insert(mk_plugin(Some("ns1"), "p"));
    let plugins = mk_collector(&cluster, &["ns1"], "ns1");

    assert_ok!(plugins.delete("p", "ns1").await);
    assert!(cluster.object::<Plugin>("ns1", "p").is_none());

    let err = assert_err!(plugins.delete("p", "ns1").await);
    assert!(err.is_not_found(), "unexpected error: {err}");
}
