use crate::{Error, Result};
use ahash::AHashSet as HashSet;

/// The namespaces that an identity is allowed to reach.
///
/// The set is ordered and de-duplicated, and it never changes once built. An
/// empty set observes nothing; it does not mean "all namespaces".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedNamespaces {
    names: Vec<String>,
    default_namespace: String,
}

impl ObservedNamespaces {
    /// Builds the set from configured names, keeping the first occurrence of
    /// each and ignoring blank entries.
    ///
    /// `default_namespace` is where resources that name no namespace are
    /// created. It is not implicitly observed.
    pub fn new(
        names: impl IntoIterator<Item = impl AsRef<str>>,
        default_namespace: impl ToString,
    ) -> Self {
        let mut seen = HashSet::new();
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty() && seen.insert(n.clone()))
            .collect();
        Self {
            names,
            default_namespace: default_namespace.to_string(),
        }
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_observed(&self, namespace: &str) -> bool {
        self.names.iter().any(|n| n == namespace)
    }

    /// Fails with [`Error::NotObservedNamespace`] unless `namespace` is
    /// observed. Callers must check before issuing any cluster call.
    pub fn require_observed(&self, namespace: &str) -> Result<()> {
        if self.is_observed(namespace) {
            return Ok(());
        }
        tracing::debug!(%namespace, "Rejected unobserved namespace");
        Err(Error::NotObservedNamespace {
            namespace: namespace.to_string(),
        })
    }

    /// The namespace an operation runs in when the caller names none.
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Resolves the namespace a new resource is placed in and authorizes it.
    pub fn resolve_target<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        let namespace = requested
            .filter(|ns| !ns.is_empty())
            .unwrap_or(self.default_namespace.as_str());
        self.require_observed(namespace)?;
        Ok(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_configured_order_without_duplicates() {
        let ns = ObservedNamespaces::new(["b", "a", " b ", "", "c", "a"], "a");
        assert_eq!(ns.iter().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert_eq!(ns.len(), 3);
    }

    #[test]
    fn empty_set_observes_nothing() {
        let ns = ObservedNamespaces::new(Vec::<String>::new(), "default");
        assert!(ns.is_empty());
        assert!(!ns.is_observed("default"));
        assert!(matches!(
            ns.require_observed("default"),
            Err(Error::NotObservedNamespace { namespace }) if namespace == "default"
        ));
    }

    #[test]
    fn requires_membership() {
        let ns = ObservedNamespaces::new(["ns1", "ns2"], "ns1");
        assert!(ns.require_observed("ns2").is_ok());
        assert!(matches!(
            ns.require_observed("kube-system"),
            Err(Error::NotObservedNamespace { .. })
        ));
    }

    #[test]
    fn resolves_target_namespace() {
        let ns = ObservedNamespaces::new(["ns1", "ns2"], "ns1");
        assert_eq!(ns.resolve_target(None).unwrap(), "ns1");
        assert_eq!(ns.resolve_target(Some("")).unwrap(), "ns1");
        assert_eq!(ns.resolve_target(Some("ns2")).unwrap(), "ns2");
        assert!(ns.resolve_target(Some("ns3")).is_err());

        let unobserved_default = ObservedNamespaces::new(["ns1"], "elsewhere");
        assert!(matches!(
            unobserved_default.resolve_target(None),
            Err(Error::NotObservedNamespace { namespace }) if namespace == "elsewhere"
        ));
    }
}
