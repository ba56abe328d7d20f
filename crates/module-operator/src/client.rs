//! Access to the cluster, expressed over unstructured objects.
//!
//! The engine never talks to `kube::Api` directly; everything goes through [`ClusterStore`] so the
//! same reconcile code runs against a real API server and against the in-memory store used in
//! tests.

use std::fmt::{self, Display};

use async_trait::async_trait;
use kube::{
    api::{ApiResource, DeleteParams, PostParams},
    core::{DynamicObject, ErrorResponse},
    Api, ResourceExt,
};
use snafu::{OptionExt, ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create kubernetes client"))]
    CreateKubeClient { source: kube::Error },

    #[snafu(display("failed to get {kind} {key}"))]
    GetObject {
        source: kube::Error,
        kind: String,
        key: ObjectKey,
    },

    #[snafu(display("failed to create {kind} {key}"))]
    CreateObject {
        source: kube::Error,
        kind: String,
        key: ObjectKey,
    },

    #[snafu(display("failed to replace {kind} {key}"))]
    ReplaceObject {
        source: kube::Error,
        kind: String,
        key: ObjectKey,
    },

    #[snafu(display("failed to replace status of {kind} {key}"))]
    ReplaceStatus {
        source: kube::Error,
        kind: String,
        key: ObjectKey,
    },

    #[snafu(display("failed to delete {kind} {key}"))]
    DeleteObject {
        source: kube::Error,
        kind: String,
        key: ObjectKey,
    },

    #[snafu(display("{kind} {key} was modified concurrently"))]
    Conflict { kind: String, key: ObjectKey },

    #[snafu(display("{kind} {key} already exists"))]
    AlreadyExists { kind: String, key: ObjectKey },

    #[snafu(display("{kind} {key} not found"))]
    NotFound { kind: String, key: ObjectKey },

    #[snafu(display("{kind} object has no name"))]
    MissingObjectKey { kind: String },

    #[snafu(display("failed to serialize {kind} {key}"))]
    SerializeObject {
        source: serde_json::Error,
        kind: String,
        key: ObjectKey,
    },
}

impl Error {
    /// Whether the write lost an optimistic concurrency race and can simply be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Namespace and name of an object. Cluster scoped objects use an empty namespace.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        Some(Self::new(
            obj.namespace().unwrap_or_default(),
            obj.metadata.name.clone()?,
        ))
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Reads and writes unstructured objects.
///
/// `replace` and `replace_status` are optimistic: they fail with [`Error::Conflict`] when the
/// object's `resourceVersion` is stale.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Returns `None` if the object does not exist.
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Writes metadata and spec. The status is ignored.
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Writes the status subresource. Everything else is ignored.
    async fn replace_status(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Requests deletion. Deleting an object that is already gone is not an error.
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()>;
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [`kube::Client`] and implements [`ClusterStore`] on top of it.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    post_params: PostParams,
    delete_params: DeleteParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Returns an [`Api`] for the resource in `namespace`, or across all namespaces if it is
    /// empty.
    pub fn get_api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }
}

/// Creates a [`Client`] from the ambient kubeconfig or in-cluster configuration.
pub async fn create_client(field_manager: Option<String>) -> Result<Client> {
    let client = kube::Client::try_default()
        .await
        .context(CreateKubeClientSnafu)?;
    Ok(Client::new(client, field_manager))
}

pub(crate) fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ErrorResponse { code, .. }) => Some(*code),
        _ => None,
    }
}

fn key_of(ar: &ApiResource, obj: &DynamicObject) -> Result<ObjectKey> {
    ObjectKey::from_object(obj).context(MissingObjectKeySnafu {
        kind: ar.kind.clone(),
    })
}

#[async_trait]
impl ClusterStore for Client {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        self.get_api(ar, &key.namespace)
            .get_opt(&key.name)
            .await
            .context(GetObjectSnafu {
                kind: ar.kind.clone(),
                key: key.clone(),
            })
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(ar, obj)?;
        match self
            .get_api(ar, &key.namespace)
            .create(&self.post_params, obj)
            .await
        {
            Ok(created) => Ok(created),
            Err(err) if api_error_code(&err) == Some(409) => AlreadyExistsSnafu {
                kind: ar.kind.clone(),
                key,
            }
            .fail(),
            Err(err) => Err(err).context(CreateObjectSnafu {
                kind: ar.kind.clone(),
                key,
            }),
        }
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(ar, obj)?;
        match self
            .get_api(ar, &key.namespace)
            .replace(&key.name, &self.post_params, obj)
            .await
        {
            Ok(replaced) => Ok(replaced),
            Err(err) => Err(classify_write_error(err, ar, key, WriteKind::Object)),
        }
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = key_of(ar, obj)?;
        let data = serde_json::to_vec(obj).context(SerializeObjectSnafu {
            kind: ar.kind.clone(),
            key: key.clone(),
        })?;
        match self
            .get_api(ar, &key.namespace)
            .replace_status(&key.name, &self.post_params, data)
            .await
        {
            Ok(replaced) => Ok(replaced),
            Err(err) => Err(classify_write_error(err, ar, key, WriteKind::Status)),
        }
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        match self
            .get_api(ar, &key.namespace)
            .delete(&key.name, &self.delete_params)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if api_error_code(&err) == Some(404) => Ok(()),
            Err(err) => Err(err).context(DeleteObjectSnafu {
                kind: ar.kind.clone(),
                key: key.clone(),
            }),
        }
    }
}

enum WriteKind {
    Object,
    Status,
}

fn classify_write_error(
    err: kube::Error,
    ar: &ApiResource,
    key: ObjectKey,
    write: WriteKind,
) -> Error {
    let kind = ar.kind.clone();
    match api_error_code(&err) {
        Some(409) => Error::Conflict { kind, key },
        Some(404) => Error::NotFound { kind, key },
        _ => match write {
            WriteKind::Object => Error::ReplaceObject {
                source: err,
                kind,
                key,
            },
            WriteKind::Status => Error::ReplaceStatus {
                source: err,
                kind,
                key,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ObjectMeta;

    use super::*;

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::new("ns", "name").to_string(), "ns/name");
        assert_eq!(ObjectKey::new("", "cluster-wide").to_string(), "cluster-wide");
    }

    #[test]
    fn object_key_from_object() {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let mut obj = DynamicObject::new("cm", &ar).within("ns");
        assert_eq!(ObjectKey::from_object(&obj), Some(ObjectKey::new("ns", "cm")));

        obj.metadata = ObjectMeta::default();
        assert_eq!(ObjectKey::from_object(&obj), None);
    }

    #[test]
    fn api_errors_are_classified() {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let api_error = |code| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_owned(),
                message: "nope".to_owned(),
                reason: String::new(),
                code,
            })
        };

        assert!(
            classify_write_error(api_error(409), &ar, ObjectKey::new("ns", "a"), WriteKind::Status)
                .is_conflict()
        );
        assert!(
            classify_write_error(api_error(404), &ar, ObjectKey::new("ns", "a"), WriteKind::Object)
                .is_not_found()
        );
        assert!(matches!(
            classify_write_error(api_error(500), &ar, ObjectKey::new("ns", "a"), WriteKind::Object),
            Error::ReplaceObject { .. }
        ));
    }
}
