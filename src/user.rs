//! User (subject) context and its redacted JSON projection.

use crate::config::Config;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Built-in optional text attributes.
const BUILTIN_ATTRIBUTES: &[&str] = &[
    "secondary", "ip", "firstName", "lastName", "email", "name", "avatar", "country",
];

/// A subject being evaluated against flags.
///
/// `key` is immutable after construction: there is no setter for it, only
/// constructors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct User {
    key: String,
    pub secondary: Option<String>,
    pub ip: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub country: Option<String>,
    pub anonymous: bool,
    pub custom: Map<String, Value>,
    pub private_attribute_names: HashSet<String>,
}

impl User {
    /// Creates a user from just a key. Every other field defaults to unset.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn with_secondary(mut self, value: impl Into<String>) -> Self {
        self.secondary = Some(value.into());
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(name.into(), value.into());
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_private_attribute(mut self, name: impl Into<String>) -> Self {
        self.private_attribute_names.insert(name.into());
        self
    }

    /// Looks up a built-in field, `anonymous`, or a `custom` entry by name.
    ///
    /// `"key"` is always resolvable to the text key itself, matching the
    /// default bucketing attribute.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        match name {
            "key" => Some(Value::String(self.key.clone())),
            "secondary" => self.secondary.clone().map(Value::String),
            "ip" => self.ip.clone().map(Value::String),
            "firstName" => self.first_name.clone().map(Value::String),
            "lastName" => self.last_name.clone().map(Value::String),
            "email" => self.email.clone().map(Value::String),
            "name" => self.name.clone().map(Value::String),
            "avatar" => self.avatar.clone().map(Value::String),
            "country" => self.country.clone().map(Value::String),
            "anonymous" => Some(Value::Bool(self.anonymous)),
            _ => self.custom.get(name).cloned(),
        }
    }

    fn builtin_text_fields(&self) -> HashMap<&'static str, &Option<String>> {
        let mut map = HashMap::new();
        map.insert("secondary", &self.secondary);
        map.insert("ip", &self.ip);
        map.insert("firstName", &self.first_name);
        map.insert("lastName", &self.last_name);
        map.insert("email", &self.email);
        map.insert("name", &self.name);
        map.insert("avatar", &self.avatar);
        map.insert("country", &self.country);
        map
    }

    /// Serialises the user to JSON, moving redacted attributes into a
    /// `privateAttrs` array per `config`'s and this user's private
    /// attribute policy. `key` and `anonymous` are never redacted.
    pub fn to_json(&self, config: &Config, redact: bool) -> Value {
        let mut obj = Map::new();
        obj.insert("key".into(), Value::String(self.key.clone()));
        obj.insert("anonymous".into(), Value::Bool(self.anonymous));

        let mut redacted = Vec::new();

        let is_private = |name: &str| -> bool {
            redact
                && (config.all_attributes_private
                    || config.private_attribute_names.contains(name)
                    || self.private_attribute_names.contains(name))
        };

        for (name, value) in self.builtin_text_fields() {
            let Some(value) = value else { continue };
            if is_private(name) {
                redacted.push(name.to_string());
            } else {
                obj.insert(name.to_string(), Value::String(value.clone()));
            }
        }

        if !self.custom.is_empty() {
            let mut custom = Map::new();
            for (name, value) in &self.custom {
                if is_private(name) {
                    redacted.push(name.clone());
                } else {
                    custom.insert(name.clone(), value.clone());
                }
            }
            if !custom.is_empty() {
                obj.insert("custom".into(), Value::Object(custom));
            }
        }

        if !redacted.is_empty() {
            redacted.sort();
            obj.insert(
                "privateAttrs".into(),
                Value::Array(redacted.into_iter().map(Value::String).collect()),
            );
        }

        Value::Object(obj)
    }
}

/// Whether an attribute value is bucketable/comparable on its own (not an
/// object or array).
pub fn valid_attribute_value(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_resolves_via_value_of() {
        let user = User::new("abc");
        assert_eq!(user.value_of("key"), Some(Value::String("abc".into())));
    }

    #[test]
    fn custom_attribute_lookup() {
        let user = User::new("abc").with_custom("plan", "enterprise");
        assert_eq!(
            user.value_of("plan"),
            Some(Value::String("enterprise".into()))
        );
        assert_eq!(user.value_of("missing"), None);
    }

    #[test]
    fn key_and_anonymous_never_redacted() {
        let config = Config::builder().all_attributes_private(true).build();
        let user = User::new("abc").with_anonymous(true);
        let json = user.to_json(&config, true);
        assert_eq!(json["key"], Value::String("abc".into()));
        assert_eq!(json["anonymous"], Value::Bool(true));
        assert!(json.get("privateAttrs").is_none());
    }

    #[test]
    fn redacts_custom_attribute_when_listed_on_user() {
        let config = Config::builder().build();
        let user = User::new("abc")
            .with_custom("ssn", "123-45-6789")
            .with_private_attribute("ssn");
        let json = user.to_json(&config, true);
        assert!(json.get("custom").is_none());
        let private = json["privateAttrs"].as_array().unwrap();
        assert!(private.contains(&Value::String("ssn".into())));
    }

    #[test]
    fn no_redaction_when_flag_is_false() {
        let config = Config::builder().all_attributes_private(true).build();
        let user = User::new("abc").with_custom("ssn", "123-45-6789");
        let json = user.to_json(&config, false);
        assert_eq!(json["custom"]["ssn"], Value::String("123-45-6789".into()));
    }

    #[test]
    fn all_attributes_private_redacts_builtins() {
        let config = Config::builder().all_attributes_private(true).build();
        let user = User {
            key: "abc".into(),
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        let json = user.to_json(&config, true);
        assert!(json.get("email").is_none());
        let private = json["privateAttrs"].as_array().unwrap();
        assert!(private.contains(&Value::String("email".into())));
    }
}
