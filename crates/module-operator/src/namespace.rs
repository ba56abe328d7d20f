use std::{convert::Infallible, fmt, str::FromStr};

use kube::{api::ApiResource, core::DynamicObject, Api};

/// Specify a namespace to watch, or `All` to watch every namespace in the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WatchNamespace {
    #[default]
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_string())
        }
    }
}

impl FromStr for WatchNamespace {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for WatchNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("<all>"),
            Self::One(namespace) => f.write_str(namespace),
        }
    }
}

impl WatchNamespace {
    /// The namespace to restrict secondary watches to, if any.
    pub fn as_option(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::One(namespace) => Some(namespace),
        }
    }

    /// Returns an [`Api`] object which is either namespaced or not depending on whether
    /// or not the [`WatchNamespace`] is `All` or `One`.
    pub fn get_api(&self, client: kube::Client, ar: &ApiResource) -> Api<DynamicObject> {
        match self {
            Self::All => Api::all_with(client, ar),
            Self::One(namespace) => Api::namespaced_with(client, namespace, ar),
        }
    }
}
