//! Injected logger scopes.
//!
//! The runtime never logs through a package-level default. Each component
//! receives a [`Logger`] through its constructor and derives child scopes
//! from it; the scope is a `tracing` span carrying a `namespace` field, so
//! whatever subscriber the binary installs sees one namespace per component.

use tracing::Span;

/// A namespaced logging scope.
#[derive(Debug, Clone)]
pub struct Logger {
    namespace: String,
    span: Span,
}

impl Logger {
    /// Create a root scope.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let span = tracing::info_span!(parent: None, "scope", namespace = %namespace);
        Self { namespace, span }
    }

    /// A scope that records nothing. Handy in tests.
    pub fn disabled() -> Self {
        Self {
            namespace: String::new(),
            span: Span::none(),
        }
    }

    /// Derive a child scope nested under this one.
    pub fn with(&self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let span = tracing::info_span!(parent: &self.span, "scope", namespace = %namespace);
        Self { namespace, span }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The span to instrument futures with.
    pub fn span(&self) -> &Span {
        &self.span
    }
}
