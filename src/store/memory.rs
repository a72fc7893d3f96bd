use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::{Map, Value};

use super::{ResourceStore, StoreObject};
use crate::error::{Error, Result};

/// Store operations, used to target injected failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Failure returned by an injected fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Conflict,
    Unavailable,
    /// The object vanished between the caller's read and this call
    NotFound,
}

impl FailureKind {
    fn into_error(self, op: Operation, kind: &str) -> Error {
        match self {
            FailureKind::Conflict => Error::Conflict(format!("injected conflict on {:?} {}", op, kind)),
            FailureKind::Unavailable => {
                Error::Unavailable(format!("injected outage on {:?} {}", op, kind))
            }
            FailureKind::NotFound => Error::NotFound(format!("injected removal on {:?} {}", op, kind)),
        }
    }
}

type Slot = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Slot, Value>,
    version: u64,
    writes: u64,
    faults: VecDeque<(Operation, String, FailureKind)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_fault(&mut self, op: Operation, kind: &str) -> Result<()> {
        let pos = self
            .faults
            .iter()
            .position(|(o, k, _)| *o == op && k == kind);
        match pos.and_then(|i| self.faults.remove(i)) {
            Some((_, _, failure)) => Err(failure.into_error(op, kind)),
            None => Ok(()),
        }
    }

    /// Remove an object and garbage-collect everything owned by it
    fn remove(&mut self, slot: &Slot) {
        let Some(removed) = self.objects.remove(slot) else {
            return;
        };
        let Some(uid) = meta_str(&removed, "uid").map(str::to_string) else {
            return;
        };
        let dependents: Vec<Slot> = self
            .objects
            .iter()
            .filter(|(_, v)| owner_uids(v).any(|owner| owner == uid))
            .map(|(s, _)| s.clone())
            .collect();
        for dependent in dependents {
            self.request_deletion(&dependent);
        }
    }

    /// Two-phase deletion: mark while finalizers remain, remove otherwise
    fn request_deletion(&mut self, slot: &Slot) {
        let has_finalizers = self.objects.get(slot).map(has_finalizers).unwrap_or(false);
        if !has_finalizers {
            self.remove(slot);
            return;
        }
        let version = self.next_version();
        if let Some(meta) = self.objects.get_mut(slot).and_then(metadata_mut) {
            if !meta.contains_key("deletionTimestamp") {
                meta.insert("deletionTimestamp".to_string(), now());
            }
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }
    }
}

/// In-process [`ResourceStore`] with Kubernetes-like semantics: resource
/// versions, generations, two-phase deletion via finalizers, owner-reference
/// cascade and status subresource separation.
///
/// Failures can be injected per operation and kind to exercise retry paths.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as-is (status included), assigning uid and version.
    /// Not counted as a write and never subject to injected faults.
    pub fn seed<K: StoreObject>(&self, obj: K) -> Result<K> {
        let slot = slot_of(&obj)?;
        let mut state = self.state();
        let version = state.next_version();
        let mut value = serde_json::to_value(&obj)?;
        let meta = metadata_mut(&mut value).ok_or_else(|| Error::fatal("object without metadata"))?;
        if !meta.contains_key("uid") {
            meta.insert("uid".to_string(), Value::String(format!("uid-{}", version)));
        }
        meta.insert("resourceVersion".to_string(), Value::String(version));
        meta.entry("generation").or_insert(Value::from(1));
        let stored = serde_json::from_value(value.clone())?;
        state.objects.insert(slot, value);
        Ok(stored)
    }

    /// Current copy of an object without going through the async API
    pub fn snapshot<K: StoreObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state();
        state
            .objects
            .get(&(K::kind(&()).to_string(), namespace.to_string(), name.to_string()))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Every object of one kind in a namespace
    pub fn objects<K: StoreObject>(&self, namespace: &str) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let state = self.state();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Make the next matching call fail once
    pub fn fail_next<K: StoreObject>(&self, op: Operation, failure: FailureKind) {
        self.state()
            .faults
            .push_back((op, K::kind(&()).to_string(), failure));
    }

    /// Number of successful writes (create, update, status update, delete)
    pub fn writes(&self) -> u64 {
        self.state().writes
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let kind = K::kind(&()).to_string();
        let mut state = self.state();
        state.take_fault(Operation::Get, &kind)?;
        state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    async fn list<K: StoreObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let requirements = parse_selector(selector)?;
        let mut state = self.state();
        state.take_fault(Operation::List, &kind)?;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, v)| labels_match(v, &requirements))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let slot = slot_of(obj)?;
        let mut state = self.state();
        state.take_fault(Operation::Create, &slot.0)?;
        if state.objects.contains_key(&slot) {
            return Err(Error::Conflict(format!(
                "{} {}/{} already exists",
                slot.0, slot.1, slot.2
            )));
        }

        let version = state.next_version();
        let mut value = serde_json::to_value(obj)?;
        if let Some(body) = value.as_object_mut() {
            body.remove("status");
        }
        let meta = metadata_mut(&mut value).ok_or_else(|| Error::fatal("object without metadata"))?;
        meta.insert("uid".to_string(), Value::String(format!("uid-{}", version)));
        meta.insert("resourceVersion".to_string(), Value::String(version));
        meta.insert("generation".to_string(), Value::from(1));
        meta.insert("creationTimestamp".to_string(), now());
        meta.remove("deletionTimestamp");

        let created = serde_json::from_value(value.clone())?;
        state.objects.insert(slot, value);
        state.writes += 1;
        Ok(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let slot = slot_of(obj)?;
        let mut state = self.state();
        state.take_fault(Operation::Update, &slot.0)?;
        let current = current_for_write(&state, &slot, obj.resource_version().as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        let generation = current
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if body_of(&value) == body_of(&current) {
            generation
        } else {
            generation + 1
        };

        let version = state.next_version();
        if let Some(body) = value.as_object_mut() {
            match current.get("status") {
                Some(status) => body.insert("status".to_string(), status.clone()),
                None => body.remove("status"),
            };
        }
        let meta = metadata_mut(&mut value).ok_or_else(|| Error::fatal("object without metadata"))?;
        for preserved in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match current.get("metadata").and_then(|m| m.get(preserved)) {
                Some(v) => meta.insert(preserved.to_string(), v.clone()),
                None => meta.remove(preserved),
            };
        }
        meta.insert("resourceVersion".to_string(), Value::String(version));
        meta.insert("generation".to_string(), Value::from(generation));

        let updated = serde_json::from_value(value.clone())?;
        let released = meta_str(&value, "deletionTimestamp").is_some() && !has_finalizers(&value);
        state.objects.insert(slot.clone(), value);
        state.writes += 1;
        if released {
            state.remove(&slot);
        }
        Ok(updated)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let slot = slot_of(obj)?;
        let mut state = self.state();
        state.take_fault(Operation::UpdateStatus, &slot.0)?;
        let mut current = current_for_write(&state, &slot, obj.resource_version().as_deref())?;

        let status = serde_json::to_value(obj)?.get("status").cloned();
        let version = state.next_version();
        if let Some(body) = current.as_object_mut() {
            match status {
                Some(status) => body.insert("status".to_string(), status),
                None => body.remove("status"),
            };
        }
        if let Some(meta) = metadata_mut(&mut current) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }

        let updated = serde_json::from_value(current.clone())?;
        state.objects.insert(slot, current);
        state.writes += 1;
        Ok(updated)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        expected_version: Option<&str>,
    ) -> Result<()> {
        let slot = (K::kind(&()).to_string(), namespace.to_string(), name.to_string());
        let mut state = self.state();
        if let Err(e) = state.take_fault(Operation::Delete, &slot.0) {
            // Someone else got there first
            if matches!(e, Error::NotFound(_)) {
                state.request_deletion(&slot);
            }
            return Err(e);
        }
        current_for_write(&state, &slot, expected_version)?;
        state.request_deletion(&slot);
        state.writes += 1;
        Ok(())
    }
}

fn slot_of<K: StoreObject>(obj: &K) -> Result<Slot> {
    let kind = K::kind(&()).to_string();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::fatal(format!("{} {} has no namespace", kind, obj.name_any())))?;
    let name = obj.meta().name.clone().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::Rejected {
            code: 422,
            message: format!("{} in {} has no name", kind, namespace),
        });
    }
    Ok((kind, namespace, name))
}

/// Stored value, provided the caller's expected version still matches
fn current_for_write(state: &State, slot: &Slot, expected: Option<&str>) -> Result<Value> {
    let current = state
        .objects
        .get(slot)
        .ok_or_else(|| Error::NotFound(format!("{} {}/{}", slot.0, slot.1, slot.2)))?;
    if let Some(expected) = expected {
        if meta_str(current, "resourceVersion") != Some(expected) {
            return Err(Error::Conflict(format!(
                "{} {}/{} has been modified",
                slot.0, slot.1, slot.2
            )));
        }
    }
    Ok(current.clone())
}

fn now() -> Value {
    serde_json::to_value(Time(Utc::now())).unwrap_or(Value::Null)
}

fn metadata_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    value.get_mut("metadata")?.as_object_mut()
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get("metadata")?.get(field)?.as_str()
}

fn has_finalizers(value: &Value) -> bool {
    value
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn owner_uids(value: &Value) -> impl Iterator<Item = &str> {
    value
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("uid").and_then(Value::as_str))
}

/// Everything but metadata and status, used to decide generation bumps
fn body_of(value: &Value) -> Option<Map<String, Value>> {
    let mut body = value.as_object()?.clone();
    body.remove("metadata");
    body.remove("status");
    Some(body)
}

fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|requirement| {
            requirement
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::Rejected {
                    code: 400,
                    message: format!("unsupported label selector '{}'", requirement),
                })
        })
        .collect()
}

fn labels_match(value: &Value, requirements: &[(String, String)]) -> bool {
    let labels = value.get("metadata").and_then(|m| m.get("labels"));
    requirements.iter().all(|(k, v)| {
        labels
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            .map(|actual| actual == v)
            .unwrap_or(false)
    })
}
