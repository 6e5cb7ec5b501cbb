//! Field-conflict resolution for rejected server-side applies.
//!
//! Given the locally desired object, the remote object and the server's
//! conflict causes, rewrite the local object so every contested leaf either
//! takes the remote's current value or disappears, and report each as a
//! lost-ownership record. Forced applies skip this entirely.

use anyhow::{anyhow, bail, Result};
use rudder_kube::ConflictStatus;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostOwnership {
    pub field: String,
    pub manager: String,
}

/// Rewrite `local` per the conflict causes. Returns the rewritten object and
/// the lost-ownership records, in cause order.
pub fn resolve_conflicts(
    local: &Value,
    remote: &Value,
    status: &ConflictStatus,
) -> Result<(Value, Vec<LostOwnership>)> {
    let mut out = local.clone();
    let mut lost = Vec::with_capacity(status.causes.len());
    for cause in &status.causes {
        let path = parse_field_path(&cause.field)?;
        match lookup(remote, &path) {
            Some(remote_value) => {
                let remote_value = remote_value.clone();
                set(&mut out, &path, remote_value);
            }
            None => remove(&mut out, &path),
        }
        lost.push(LostOwnership { field: cause.field.clone(), manager: cause.manager.clone() });
    }
    Ok((out, lost))
}

/// One step of a managed-fields path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    /// `.name`
    Field(String),
    /// `[3]`
    Index(usize),
    /// `[name="nginx"]` — associative list entry
    Key { key: String, value: String },
}

/// Parse a managed-fields style path: `.spec.template.spec.containers[name="web"].image`.
pub fn parse_field_path(s: &str) -> Result<Vec<PathSeg>> {
    let mut segs = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b'.' && bytes[i] != b'[' {
                    i += 1;
                }
                if i == start {
                    bail!("empty field segment in path {s:?}");
                }
                segs.push(PathSeg::Field(s[start..i].to_string()));
            }
            b'[' => {
                let close = s[i..]
                    .find(']')
                    .map(|p| i + p)
                    .ok_or_else(|| anyhow!("unterminated '[' in path {s:?}"))?;
                let inner = &s[i + 1..close];
                if let Ok(idx) = inner.parse::<usize>() {
                    segs.push(PathSeg::Index(idx));
                } else {
                    let (key, value) = inner
                        .split_once('=')
                        .ok_or_else(|| anyhow!("unsupported list selector {inner:?} in path {s:?}"))?;
                    let value = value.trim_matches('"');
                    segs.push(PathSeg::Key { key: key.to_string(), value: value.to_string() });
                }
                i = close + 1;
            }
            _ => bail!("unexpected character at byte {i} in path {s:?}"),
        }
    }
    if segs.is_empty() {
        bail!("empty field path");
    }
    Ok(segs)
}

fn step<'a>(v: &'a Value, seg: &PathSeg) -> Option<&'a Value> {
    match seg {
        PathSeg::Field(name) => v.get(name),
        PathSeg::Index(i) => v.get(i),
        PathSeg::Key { key, value } => v
            .as_array()?
            .iter()
            .find(|e| e.get(key).and_then(|k| k.as_str()) == Some(value)),
    }
}

fn step_mut<'a>(v: &'a mut Value, seg: &PathSeg) -> Option<&'a mut Value> {
    match seg {
        PathSeg::Field(name) => v.get_mut(name),
        PathSeg::Index(i) => v.get_mut(i),
        PathSeg::Key { key, value } => v
            .as_array_mut()?
            .iter_mut()
            .find(|e| e.get(key).and_then(|k| k.as_str()) == Some(value.as_str())),
    }
}

fn lookup<'a>(v: &'a Value, path: &[PathSeg]) -> Option<&'a Value> {
    path.iter().try_fold(v, step)
}

/// Overwrite the leaf at `path` if its parent exists in `v`; a path the local
/// object never had needs no rewrite.
fn set(v: &mut Value, path: &[PathSeg], new_value: Value) {
    let (leaf, parents) = match path.split_last() {
        Some(x) => x,
        None => return,
    };
    let mut cur = v;
    for seg in parents {
        cur = match step_mut(cur, seg) {
            Some(c) => c,
            None => return,
        };
    }
    match leaf {
        PathSeg::Field(name) => {
            if let Some(map) = cur.as_object_mut() {
                map.insert(name.clone(), new_value);
            }
        }
        PathSeg::Index(i) => {
            if let Some(arr) = cur.as_array_mut() {
                if *i < arr.len() {
                    arr[*i] = new_value;
                }
            }
        }
        PathSeg::Key { .. } => {
            if let Some(slot) = step_mut(cur, leaf) {
                *slot = new_value;
            }
        }
    }
}

fn remove(v: &mut Value, path: &[PathSeg]) {
    let (leaf, parents) = match path.split_last() {
        Some(x) => x,
        None => return,
    };
    let mut cur = v;
    for seg in parents {
        cur = match step_mut(cur, seg) {
            Some(c) => c,
            None => return,
        };
    }
    match leaf {
        PathSeg::Field(name) => {
            if let Some(map) = cur.as_object_mut() {
                map.remove(name);
            }
        }
        PathSeg::Index(i) => {
            if let Some(arr) = cur.as_array_mut() {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
        }
        PathSeg::Key { key, value } => {
            if let Some(arr) = cur.as_array_mut() {
                arr.retain(|e| e.get(key).and_then(|k| k.as_str()) != Some(value.as_str()));
            }
        }
    }
}
