use crate::config::types::AggregationConfig;
use crate::event::Event;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Condition = Arc<dyn Fn(&Event) -> Result<bool, String> + Send + Sync>;
pub type FingerprintFn = Arc<dyn Fn(&Event) -> Result<String, String> + Send + Sync>;

/// Which events fold together, and for how long.
#[derive(Clone)]
pub struct AggregationDefinition {
    pub name: String,
    pub ttl: Duration,
    condition: Condition,
    fingerprint: FingerprintFn,
}

impl fmt::Debug for AggregationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationDefinition")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl AggregationDefinition {
    pub fn new<C, F>(name: impl Into<String>, ttl: Duration, condition: C, fingerprint: F) -> Self
    where
        C: Fn(&Event) -> Result<bool, String> + Send + Sync + 'static,
        F: Fn(&Event) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            ttl,
            condition: Arc::new(condition),
            fingerprint: Arc::new(fingerprint),
        }
    }

    /// Build from configuration: every `condition` pointer must hold the
    /// expected value, and the fingerprint joins the `fingerprint` pointers.
    pub fn from_config(config: &AggregationConfig) -> Self {
        let expected: Vec<(String, Value)> = config
            .condition
            .iter()
            .map(|(pointer, value)| (pointer.clone(), value.clone()))
            .collect();
        let pointers = config.fingerprint.clone();
        let name = config.name.clone();

        Self::new(
            config.name.clone(),
            config.ttl,
            move |event: &Event| {
                Ok(expected
                    .iter()
                    .all(|(pointer, value)| event.payload.pointer(pointer) == Some(value)))
            },
            move |event: &Event| {
                let mut parts = Vec::with_capacity(pointers.len());
                for pointer in &pointers {
                    match event.payload.pointer(pointer) {
                        Some(Value::String(s)) => parts.push(s.clone()),
                        Some(other) => parts.push(other.to_string()),
                        None => return Err(format!("'{}' missing from event", pointer)),
                    }
                }
                Ok(format!("{}:{}", name, parts.join("|")))
            },
        )
    }

    pub fn matches(&self, event: &Event) -> Result<bool, String> {
        (self.condition)(event)
    }

    pub fn fingerprint(&self, event: &Event) -> Result<String, String> {
        (self.fingerprint)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config() -> AggregationConfig {
        let mut condition = BTreeMap::new();
        condition.insert("/action".to_string(), json!("login.failed"));
        AggregationConfig {
            name: "failed-logins".to_string(),
            ttl: Duration::from_secs(60),
            condition,
            fingerprint: vec!["/actor/id".to_string(), "/src_ip".to_string()],
        }
    }

    fn event(payload: Value) -> Event {
        Event::with_content_fingerprint("s", Utc::now(), payload)
    }

    #[test]
    fn test_condition_from_config() {
        let def = AggregationDefinition::from_config(&config());
        let hit = event(json!({"action": "login.failed", "actor": {"id": 7}, "src_ip": "10.0.0.1"}));
        let miss = event(json!({"action": "login.ok"}));
        assert!(def.matches(&hit).unwrap());
        assert!(!def.matches(&miss).unwrap());
    }

    #[test]
    fn test_fingerprint_from_config() {
        let def = AggregationDefinition::from_config(&config());
        let e = event(json!({"action": "login.failed", "actor": {"id": 7}, "src_ip": "10.0.0.1"}));
        assert_eq!(def.fingerprint(&e).unwrap(), "failed-logins:7|10.0.0.1");

        let partial = event(json!({"action": "login.failed", "actor": {"id": 7}}));
        assert!(def.fingerprint(&partial).is_err());
    }
}
