//! Object store access for keypair (Secret) and bundle (ConfigMap) objects.
//!
//! Controllers only see [`ObjectStore`]: opaque field maps addressed by
//! [`ResourceLocation`], with a version token for optimistic concurrency.
//! [`KubeObjectStore`] backs it with the Kubernetes API.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pki::constants::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

const FIELD_MANAGER: &str = "etcd-pki-operator";

/// Namespace + name address of a stored object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceLocation {
    pub namespace: String,
    pub name: String,
}

impl ResourceLocation {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Certificate + private key, stored as a Secret.
    KeyPair,
    /// CA bundle (or other public data), stored as a ConfigMap.
    Bundle,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::KeyPair => "Secret",
            ObjectKind::Bundle => "ConfigMap",
        }
    }
}

pub type ObjectData = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub data: ObjectData,
    /// Version token to pass back on the next write.
    pub version: Option<String>,
}

impl StoredObject {
    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// SHA-256 over the sorted fields, used to skip writes that change nothing.
    pub fn content_hash(&self) -> String {
        content_hash(&self.data)
    }
}

pub fn content_hash(data: &ObjectData) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. A missing object is reported as [`Error::NotFound`].
    async fn get(&self, kind: ObjectKind, location: &ResourceLocation) -> Result<StoredObject>;

    /// Create (`expected_version == None`) or replace an object. Fails with
    /// [`Error::Conflict`] if the stored version no longer matches.
    async fn create_or_update(
        &self,
        kind: ObjectKind,
        location: &ResourceLocation,
        data: ObjectData,
        expected_version: Option<&str>,
    ) -> Result<()>;

    /// Read an object, mapping NotFound to `None`.
    async fn get_optional(
        &self,
        kind: ObjectKind,
        location: &ResourceLocation,
    ) -> Result<Option<StoredObject>> {
        match self.get(kind, location).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Write `data` unless `existing` already holds the same content. The write is
/// conditioned on the version `existing` was read at. Returns whether a write
/// happened.
pub async fn apply_if_changed(
    store: &dyn ObjectStore,
    kind: ObjectKind,
    location: &ResourceLocation,
    data: ObjectData,
    existing: Option<&StoredObject>,
) -> Result<bool> {
    if let Some(current) = existing {
        if current.content_hash() == content_hash(&data) {
            return Ok(false);
        }
    }
    let expected_version = existing.and_then(|obj| obj.version.as_deref());
    store
        .create_or_update(kind, location, data, expected_version)
        .await?;
    Ok(true)
}

/// [`ObjectStore`] over Kubernetes Secrets and ConfigMaps.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_kube_error(err: kube::Error, kind: ObjectKind, location: &ResourceLocation) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::not_found(kind.as_str(), &location.namespace, &location.name)
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("{} {}: {}", kind.as_str(), location, resp.message))
        }
        _ => Error::KubeError(err),
    }
}

fn object_meta(location: &ResourceLocation, expected_version: Option<&str>) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    ObjectMeta {
        name: Some(location.name.clone()),
        namespace: Some(location.namespace.clone()),
        resource_version: expected_version.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Secret body for a write. `type` is only set on create: it is immutable,
/// and an apply that omits it leaves the stored type alone.
fn secret_for_write(
    location: &ResourceLocation,
    data: ObjectData,
    expected_version: Option<&str>,
) -> Secret {
    let type_ = match expected_version {
        Some(_) => None,
        // The TLS secret type requires both fields; aggregates stay Opaque.
        None if data.contains_key(TLS_CERT_KEY) && data.contains_key(TLS_PRIVATE_KEY_KEY) => {
            Some("kubernetes.io/tls".to_string())
        }
        None => Some("Opaque".to_string()),
    };
    Secret {
        metadata: object_meta(location, expected_version),
        type_,
        data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
        ..Default::default()
    }
}

fn config_map_for_write(
    location: &ResourceLocation,
    data: ObjectData,
    expected_version: Option<&str>,
) -> Result<ConfigMap> {
    let string_data = data
        .into_iter()
        .map(|(k, v)| {
            String::from_utf8(v)
                .map(|s| (k.clone(), s))
                .map_err(|_| {
                    Error::ParseError(format!("field {k} of {location} is not valid UTF-8"))
                })
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(ConfigMap {
        metadata: object_meta(location, expected_version),
        data: Some(string_data),
        ..Default::default()
    })
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, kind: ObjectKind, location: &ResourceLocation) -> Result<StoredObject> {
        match kind {
            ObjectKind::KeyPair => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &location.namespace);
                let secret = api
                    .get(&location.name)
                    .await
                    .map_err(|e| map_kube_error(e, kind, location))?;
                Ok(StoredObject {
                    data: secret
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, v.0))
                        .collect(),
                    version: secret.metadata.resource_version,
                })
            }
            ObjectKind::Bundle => {
                let api: Api<ConfigMap> =
                    Api::namespaced(self.client.clone(), &location.namespace);
                let cm = api
                    .get(&location.name)
                    .await
                    .map_err(|e| map_kube_error(e, kind, location))?;
                Ok(StoredObject {
                    data: cm
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, v.into_bytes()))
                        .collect(),
                    version: cm.metadata.resource_version,
                })
            }
        }
    }

    async fn create_or_update(
        &self,
        kind: ObjectKind,
        location: &ResourceLocation,
        data: ObjectData,
        expected_version: Option<&str>,
    ) -> Result<()> {
        // Create is a POST and fails if the object appeared meanwhile. Update
        // is a server-side apply conditioned on the resourceVersion in the
        // body; metadata owned by other managers is left in place.
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let apply = PatchParams::apply(FIELD_MANAGER).force();

        let result = match kind {
            ObjectKind::KeyPair => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &location.namespace);
                let secret = secret_for_write(location, data, expected_version);
                match expected_version {
                    None => api.create(&pp, &secret).await.map(|_| ()),
                    Some(_) => api
                        .patch(&location.name, &apply, &Patch::Apply(&secret))
                        .await
                        .map(|_| ()),
                }
            }
            ObjectKind::Bundle => {
                let api: Api<ConfigMap> =
                    Api::namespaced(self.client.clone(), &location.namespace);
                let cm = config_map_for_write(location, data, expected_version)?;
                match expected_version {
                    None => api.create(&pp, &cm).await.map(|_| ()),
                    Some(_) => api
                        .patch(&location.name, &apply, &Patch::Apply(&cm))
                        .await
                        .map(|_| ()),
                }
            }
        };

        result.map_err(|e| map_kube_error(e, kind, location))?;
        debug!(kind = kind.as_str(), location = %location, "Wrote object");
        Ok(())
    }
}
