use serde_json::{Map, Value as JsonValue};

use crate::errors::{ProviderError, ProviderResult};

/// Keys that steer merging and are never copied into a request.
const CONTROL_KEYS: [&str; 5] = ["pre_add", "overwrite", "per_model", "remove_params", "stream"];

/// Per-channel request parameters declared as a JSON object.
///
/// Recognized control keys:
/// - `pre_add: true` merges before the request is parsed instead of at send time.
/// - `overwrite: true` replaces values already present in the request.
/// - `per_model: true` reads parameters from the nested object named after the model.
/// - `remove_params: [..]` deletes those request keys before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomParameters(Map<String, JsonValue>);

impl CustomParameters {
    /// `None` for an absent or blank declaration.
    pub fn parse(raw: Option<&str>) -> ProviderResult<Option<Self>> {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(None);
        };
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(JsonValue::Object(map)) => Ok(Some(Self(map))),
            Ok(_) => Err(ProviderError::InvalidConfig(
                "custom_parameter must be a JSON object".to_string(),
            )),
            Err(err) => Err(ProviderError::InvalidConfig(format!(
                "custom_parameter is not valid JSON: {err}"
            ))),
        }
    }

    pub fn from_map(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }

    pub fn pre_add(&self) -> bool {
        self.flag("pre_add")
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(JsonValue::Bool(true)))
    }

    /// Merges the declared parameters into `request` for `model`.
    pub fn merge_into(&self, request: &mut Map<String, JsonValue>, model: &str) {
        let overwrite = self.flag("overwrite");
        let empty = Map::new();
        let params = if self.flag("per_model") {
            match self.0.get(model) {
                Some(JsonValue::Object(scoped)) => scoped,
                _ => &empty,
            }
        } else {
            &self.0
        };

        if let Some(JsonValue::Array(names)) = params.get("remove_params") {
            for name in names.iter().filter_map(JsonValue::as_str) {
                request.remove(name);
            }
        }

        for (key, value) in params {
            if CONTROL_KEYS.contains(&key.as_str()) {
                continue;
            }
            merge_value(request, key, value, overwrite);
        }
    }
}

fn merge_value(target: &mut Map<String, JsonValue>, key: &str, value: &JsonValue, overwrite: bool) {
    if overwrite || matches!(target.get(key), None | Some(JsonValue::Null)) {
        target.insert(key.to_string(), value.clone());
        return;
    }
    if let (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) =
        (target.get_mut(key), value)
    {
        for (child_key, child_value) in incoming {
            merge_value(existing, child_key, child_value, false);
        }
    }
}
