//! Test-and-set JSON patches
//!
//! Every write to a VMI goes out as an RFC 6902 patch whose `test` ops pin
//! the values the reconciler last observed. If another writer got there
//! first the API server rejects the whole patch (422) and the pass is
//! retried against fresh cache contents.

use json_patch::{AddOperation, PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use kube::api::Patch;
use serde::Serialize;
use serde_json::Value;

use kubevirt_common::Error;

/// An ordered list of patch operations applied atomically
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonPatch {
    ops: Vec<PatchOperation>,
}

fn pointer(path: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(path.iter().copied())
}

impl JsonPatch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an unconditional `add` op
    pub fn add(mut self, path: &[&str], value: Value) -> Self {
        self.ops.push(PatchOperation::Add(AddOperation {
            path: pointer(path),
            value,
        }));
        self
    }

    /// Conditionally move `path` from `observed` to `desired`
    ///
    /// With nothing observed the value is added; otherwise the observed
    /// value is tested and then replaced.
    pub fn test_and_set<T: Serialize>(
        mut self,
        path: &[&str],
        observed: Option<&T>,
        desired: &T,
    ) -> Result<Self, Error> {
        let desired = serde_json::to_value(desired)?;
        match observed {
            None => Ok(self.add(path, desired)),
            Some(observed) => {
                self.ops.push(PatchOperation::Test(TestOperation {
                    path: pointer(path),
                    value: serde_json::to_value(observed)?,
                }));
                self.ops.push(PatchOperation::Replace(ReplaceOperation {
                    path: pointer(path),
                    value: desired,
                }));
                Ok(self)
            }
        }
    }

    /// Operations in application order
    pub fn ops(&self) -> &[PatchOperation] {
        &self.ops
    }

    /// The patch as a JSON array
    pub fn to_value(&self) -> Value {
        Value::Array(
            self.ops
                .iter()
                .filter_map(|op| serde_json::to_value(op).ok())
                .collect(),
        )
    }

    /// Convert into a kube-rs JSON patch
    pub fn into_kube_patch(self) -> Patch<()> {
        Patch::Json(json_patch::Patch(self.ops))
    }
}

impl std::fmt::Display for JsonPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Apply `patch` to `document` the way the API server would
///
/// A failed `test` op rejects the whole patch as a conflict and leaves
/// `document` untouched.
#[cfg(test)]
pub(crate) fn apply_to(document: &mut Value, patch: &JsonPatch, resource: &str) -> Result<(), Error> {
    json_patch::patch(document, patch.ops()).map_err(|e| Error::conflict(resource, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STATE: &[&str] = &["status", "migrationState"];
    const LABELS: &[&str] = &["metadata", "labels"];

    #[test]
    fn ops_serialize_as_rfc6902() {
        let patch = JsonPatch::new()
            .test_and_set(LABELS, Some(&json!({})), &json!({"a": "b"}))
            .unwrap();
        assert_eq!(
            patch.to_value(),
            json!([
                {"op": "test", "path": "/metadata/labels", "value": {}},
                {"op": "replace", "path": "/metadata/labels", "value": {"a": "b"}},
            ])
        );
    }

    #[test]
    fn test_and_set_adds_when_nothing_observed() {
        let patch = JsonPatch::new()
            .test_and_set(STATE, None, &json!({"targetNode": "node01"}))
            .unwrap();
        assert_eq!(
            patch.ops(),
            &[PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["status", "migrationState"]),
                value: json!({"targetNode": "node01"}),
            })]
        );
    }

    #[test]
    fn test_and_set_tests_then_replaces_observed_value() {
        let old = json!({"targetNode": "node03"});
        let patch = JsonPatch::new()
            .test_and_set(STATE, Some(&old), &json!({"targetNode": "node01"}))
            .unwrap();
        assert_eq!(patch.ops().len(), 2);
        assert!(matches!(&patch.ops()[0], PatchOperation::Test(t) if t.value == old));
        assert!(matches!(&patch.ops()[1], PatchOperation::Replace(_)));
    }

    #[test]
    fn label_keys_with_slashes_are_escaped() {
        let patch = JsonPatch::new().add(&["metadata", "labels", "kubevirt.io/nodeName"], json!("node01"));
        assert_eq!(
            patch.to_value()[0]["path"],
            "/metadata/labels/kubevirt.io~1nodeName"
        );
    }

    mod server_semantics {
        use super::*;

        /// Story: a stale cache produces a patch that must not apply
        ///
        /// The VMI's labels changed after the reconciler read them. The test
        /// op fails and nothing in the document changes, including the op
        /// that came before it.
        #[test]
        fn story_stale_precondition_rejects_whole_patch() {
            let mut vmi = json!({
                "metadata": {"labels": {"owner": "someone-else"}},
                "status": {}
            });
            let before = vmi.clone();
            let patch = JsonPatch::new()
                .add(STATE, json!({"targetNode": "node01"}))
                .test_and_set(LABELS, Some(&json!({})), &json!({"x": "y"}))
                .unwrap();

            let err = apply_to(&mut vmi, &patch, "default/testvmi").unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(vmi, before);
        }

        #[test]
        fn story_fresh_precondition_applies_every_op() {
            let mut vmi = json!({
                "metadata": {"labels": {"a": "1"}},
                "status": {}
            });
            let patch = JsonPatch::new()
                .add(STATE, json!({"targetNode": "node01"}))
                .test_and_set(
                    LABELS,
                    Some(&json!({"a": "1"})),
                    &json!({"a": "1", "kubevirt.io/migrationTargetNodeName": "node01"}),
                )
                .unwrap();

            apply_to(&mut vmi, &patch, "default/testvmi").unwrap();
            assert_eq!(vmi["status"]["migrationState"]["targetNode"], "node01");
            assert_eq!(
                vmi["metadata"]["labels"]["kubevirt.io/migrationTargetNodeName"],
                "node01"
            );
        }

        /// Tests run in sequence, so a test after a replace sees the new value
        #[test]
        fn tests_are_evaluated_in_order() {
            let mut doc = json!({"status": {"runtimeUser": 0}});
            let patch = JsonPatch::new()
                .test_and_set(&["status", "runtimeUser"], Some(&json!(0)), &json!(107))
                .unwrap()
                .test_and_set(&["status", "runtimeUser"], Some(&json!(107)), &json!(108))
                .unwrap();

            apply_to(&mut doc, &patch, "x").unwrap();
            assert_eq!(doc["status"]["runtimeUser"], 108);
        }
    }

    #[test]
    fn converts_to_kube_json_patch() {
        let patch = JsonPatch::new()
            .add(&["status", "runtimeUser"], json!(107))
            .into_kube_patch();
        assert!(matches!(patch, Patch::Json(p) if p.0.len() == 1));
    }
}
